fn main() -> std::process::ExitCode {
    visionprep_lib::run()
}
