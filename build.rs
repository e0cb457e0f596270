//! Compiles the tunnel RPC schema with a vendored `protoc` binary so the
//! build doesn't depend on a system protobuf toolchain.

fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc binary");
    // Safety: single-threaded build script, no other code reads env concurrently.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/tunnel.proto"], &["proto"])
        .expect("compile tunnel.proto");

    println!("cargo:rerun-if-changed=proto/tunnel.proto");
}
