fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "proto/jobhost/agent/v1/agent.proto",
                "proto/jobhost/agent/v1/job.proto",
            ],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto/jobhost/agent/v1/agent.proto");
    println!("cargo:rerun-if-changed=proto/jobhost/agent/v1/job.proto");
    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
