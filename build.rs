use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let proto_dir = PathBuf::from("proto");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/");

    // The client is only needed by the end-to-end tests, but generating it
    // unconditionally keeps the build script simple.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("ratelimitd_descriptor.bin"))
        .compile_protos(
            &[proto_dir.join("ratelimitd/v1/ratelimit.proto")],
            &[&proto_dir],
        )?;

    Ok(())
}
