use std::process;

pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: mole relies on POSIX socket semantics");
        process::exit(2);
    }
}
