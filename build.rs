fn main() {
    let version = get_version();
    println!("cargo:rustc-env=PROXYDECK_VERSION={}", version);
    println!("cargo:rerun-if-env-changed=PROXYDECK_RELEASE_VERSION");

    // Declare dev_build as a valid cfg so the compiler doesn't warn about it.
    println!("cargo:rustc-check-cfg=cfg(dev_build)");

    if version.contains("-dev") {
        println!("cargo:rustc-cfg=dev_build");
    }
}

fn get_version() -> String {
    // Use PROXYDECK_RELEASE_VERSION if set (from CI release workflow), without the tag's `v`.
    if let Ok(release_version) = std::env::var("PROXYDECK_RELEASE_VERSION") {
        return release_version.trim_start_matches('v').to_string();
    }

    // Fallback to Cargo.toml version for local development
    env!("CARGO_PKG_VERSION").to_string()
}
