//! Build script for gpib-sys.
//!
//! With the `gpib-sdk` feature the crate links against the system libgpib
//! (linux-gpib). Without it, the stub implementations in `src/stubs.rs` are
//! compiled instead and nothing is linked.

fn main() {
    println!("cargo:rerun-if-env-changed=GPIB_LIB_DIR");

    #[cfg(feature = "gpib-sdk")]
    link_libgpib();
}

#[cfg(feature = "gpib-sdk")]
fn link_libgpib() {
    // pkg-config first, linux-gpib ships a libgpib.pc
    if pkg_config::probe_library("libgpib").is_ok() {
        return;
    }

    println!("cargo:rustc-link-lib=gpib");

    if let Ok(dir) = std::env::var("GPIB_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", dir);
        return;
    }

    let lib_paths = ["/usr/local/lib", "/usr/lib", "/usr/lib/x86_64-linux-gnu"];
    for path in lib_paths {
        if std::path::Path::new(path).join("libgpib.so").exists() {
            println!("cargo:rustc-link-search=native={}", path);
            break;
        }
    }
}
