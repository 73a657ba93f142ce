use crate::config::RuntimeRole;

pub fn print_startup_banner(role: RuntimeRole) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;137m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                        ████
                       ░░███
 █████████████   ██████ ░███   ██████
░░███░░███░░███ ███░░███░███  ███░░███
 ░███ ░███ ░███░███ ░███░███ ░███████
 ░███ ░███ ░███░███ ░███░███ ░███░░░
 █████░███ █████░░██████ █████░░██████
░░░░░ ░░░ ░░░░░  ░░░░░░ ░░░░░  ░░░░░░    "#;
    const APP_DESCRIPTION: &str =
        "Cluster transport for agents behind NAT: control tunnel, reverse dial, liveness.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({}) | role {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("MOLE_BUILD_DATE_UTC"),
        env!("MOLE_BUILD_REVISION"),
        role.as_str()
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Wire protocol is plaintext; run it on a trusted network.{RESET}");
    println!();
    println!("================================================================");
    println!();
}
