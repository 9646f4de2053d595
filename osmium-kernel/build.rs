use std::env;
use std::path::Path;

fn main() {
    // The linker script only applies to the bare-metal target; host
    // builds (unit tests) link normally.
    if env::var("CARGO_CFG_TARGET_ARCH").as_deref() == Ok("arm") {
        let manifest = env::var("CARGO_MANIFEST_DIR").unwrap();
        let script = Path::new(&manifest).join("kernel.ld");
        println!("cargo:rustc-link-arg-bin=osmium=-T{}", script.display());
        println!("cargo:rerun-if-changed=kernel.ld");
    }
}
