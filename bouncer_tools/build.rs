fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Generate rust code from the pauser protobuf. Per cargo docs the build
    // script must not output anywhere but $OUT_DIR.
    tonic_build::compile_protos("proto/pauser.proto")
        .unwrap_or_else(|e| panic!("failed to compile protos {e:?}"));
    Ok(())
}
