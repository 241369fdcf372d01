use std::process::ExitCode;

fn main() -> ExitCode {
    kvsweep::cmdline()
}
