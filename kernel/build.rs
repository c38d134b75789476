use std::env;

fn main() {
    let target = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    if target == "riscv64" {
        // Build startup and trap shims and archive them
        cc::Build::new()
            .compiler("riscv64-elf-gcc")
            .flag("-mabi=lp64d")
            .file("src/arch/riscv/head.S")
            .file("src/arch/riscv/swtch.S")
            .file("src/arch/riscv/trap.S")
            .compile("libcpu.a");

        let dir = env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{dir}/linkers/qemu-virt.ld");

        println!("cargo:rerun-if-changed=src/arch/riscv/head.S");
        println!("cargo:rerun-if-changed=src/arch/riscv/swtch.S");
        println!("cargo:rerun-if-changed=src/arch/riscv/trap.S");
        println!("cargo:rerun-if-changed=linkers/qemu-virt.ld");
    }

    println!("cargo:rerun-if-changed=build.rs");
}
