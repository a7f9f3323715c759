//! Protobuf wire types and the control client for the BuildKit API,
//! generated from `proto/` at build time.

#![allow(clippy::all)]

pub mod pb {
    tonic::include_proto!("pb");
}

pub mod moby {
    pub mod buildkit {
        pub mod v1 {
            tonic::include_proto!("moby.buildkit.v1");
        }
    }
}

pub use moby::buildkit::v1::control_client::ControlClient;
pub use moby::buildkit::v1::{
    SolveRequest, SolveResponse, StatusRequest, StatusResponse, Vertex, VertexLog, VertexStatus,
    VertexWarning,
};
pub use pb::{Definition, OpMetadata};

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_solve_request_field_numbers() {
        let request = SolveRequest {
            r#ref: "x".to_string(),
            exporter: "image".to_string(),
            ..Default::default()
        };
        // Ref = 1 (0x0a), Exporter = 3 (0x1a)
        assert_eq!(
            request.encode_to_vec(),
            [&[0x0a, 1, b'x'][..], &[0x1a, 5][..], &b"image"[..]].concat()
        );
    }

    #[test]
    fn test_definition_maps_encode_in_key_order() {
        let meta = |ignore_cache| OpMetadata {
            ignore_cache,
            ..Default::default()
        };
        let mut a = Definition::default();
        a.metadata.insert("sha256:b".to_string(), meta(true));
        a.metadata.insert("sha256:a".to_string(), meta(false));
        let mut b = Definition::default();
        b.metadata.insert("sha256:a".to_string(), meta(false));
        b.metadata.insert("sha256:b".to_string(), meta(true));

        assert_eq!(a.encode_to_vec(), b.encode_to_vec());
        let keys: Vec<_> = a.metadata.keys().cloned().collect();
        assert_eq!(keys, ["sha256:a", "sha256:b"]);
    }
}
