fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server stub is only used by in-process test collectors
    // (core/tests/), but building it unconditionally keeps this build
    // script simple and the generated code is negligible in size.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/telemetry.proto"], &["proto"])?;
    Ok(())
}
