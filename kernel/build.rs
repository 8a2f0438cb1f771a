use std::env;

fn main() {
    let profile = env::var("PROFILE").unwrap();
    let path = format!("../../build/{}/init.elf", profile);
    println!("cargo:rustc-env=SABLE_INIT_PATH={}", path);
}
