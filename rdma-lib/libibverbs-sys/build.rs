use std::{env, path::PathBuf};

use build_utils::find_package;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let rdma_core_home = find_package(
        "RDMA_CORE_HOME",
        &["/usr", "/usr/local"],
        &["include/infiniband/verbs.h", "include/rdma/rdma_cma.h"],
    );
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    println!("cargo:rerun-if-changed=wrapper.h");

    let bindings = bindgen::Builder::default()
        .header("wrapper.h")
        .clang_arg(format!("-I{}/include", rdma_core_home.display()))
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .prepend_enum_name(false)
        .allowlist_item(r"(ibv_|IBV_|ib_|IB_|rdma_|RDMA_).*")
        .derive_debug(false)
        .derive_default(true)
        // ibv_post_send, ibv_poll_cq and friends are static inline.
        .wrap_static_fns(true)
        .wrap_static_fns_path(out_dir.join("wrap_static_fns.c"))
        .allowlist_item(r"pthread_.*")
        .opaque_type(r"pthread_.*")
        .no_default(r"pthread_.*")
        .generate()?;
    bindings.write_to_file(out_dir.join("rdma-core-bindings.rs"))?;

    cc::Build::new()
        .file(out_dir.join("wrap_static_fns.c"))
        .include(rdma_core_home.join("include"))
        .include(env!("CARGO_MANIFEST_DIR"))
        .compile("wrap_static_fns");

    println!("cargo:rustc-link-search=native={}/lib", rdma_core_home.display());
    println!("cargo:rustc-link-lib=ibverbs");
    println!("cargo:rustc-link-lib=rdmacm");

    Ok(())
}
