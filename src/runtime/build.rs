//! Build script for kitrace-runtime
//!
//! Compiles the BuildKit proto definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Op digests are taken over encoded bytes, so maps inside ops must
    // encode in a stable order.
    let mut config = prost_build::Config::new();
    config.btree_map([
        ".pb.SourceOp.attrs",
        ".pb.OpMetadata.description",
        ".pb.Definition.metadata",
    ]);

    tonic_build::configure()
        .build_server(false) // buildkitd is the server
        .build_client(true)
        .compile_with_config(config, &["proto/control.proto", "proto/ops.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/control.proto");
    println!("cargo:rerun-if-changed=proto/ops.proto");

    Ok(())
}
