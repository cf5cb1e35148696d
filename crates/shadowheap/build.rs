fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();

    if target_os == "linux" {
        // The preload artifact must export exactly the four C allocator
        // entry points; everything else stays local.
        let script = format!("{}/linker/version_script.lds", manifest_dir);
        println!("cargo:rustc-cdylib-link-arg=-Wl,--version-script={}", script);
        println!("cargo:rerun-if-changed=linker/version_script.lds");
    }
}
