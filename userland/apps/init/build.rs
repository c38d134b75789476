use std::env;

fn main() {
    if env::var("CARGO_CFG_TARGET_ARCH").unwrap() == "riscv64" {
        let dir = env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{dir}/../../linkers/user.ld");
        println!("cargo:rustc-link-arg=-zmax-page-size=4096");
        println!("cargo:rerun-if-changed=../../linkers/user.ld");
    }
    println!("cargo:rerun-if-changed=build.rs");
}
