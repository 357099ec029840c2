fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protobuf_src::protoc());
    }

    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/gordon.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/gordon.proto");
    Ok(())
}
