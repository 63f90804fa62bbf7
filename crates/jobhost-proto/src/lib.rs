// Re-export compiled gRPC protos.
//
// All `.proto` files live in this crate so the agent and any client share a
// single Rust type source.

pub mod jobhost {
    pub mod agent {
        pub mod v1 {
            tonic::include_proto!("jobhost.agent.v1");
        }
    }
}

pub use jobhost::agent::v1 as agent_v1;
