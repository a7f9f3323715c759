//! LLB build graph construction and marshaling.
//!
//! A [`State`] is an immutable handle on the last op of a chain. Each
//! `run` appends an exec op mounted on the root filesystem of the
//! previous state. [`State::marshal`] serializes the chain into a
//! [`pb::Definition`] the way buildkitd expects it: one encoded op per
//! vertex (inputs first), a terminal op pointing at the head, and
//! metadata keyed by `sha256:` digest.

use std::collections::BTreeMap;
use std::sync::Arc;

use kitrace_core::error::{ReproError, Result};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::proto::pb;

/// `PATH` injected into exec ops that do not set one.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Metadata description key buildkitd uses as the vertex display name.
const CUSTOM_NAME_KEY: &str = "llb.customname";

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Target platform of an op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }

    fn to_pb(&self) -> pb::Platform {
        pb::Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            variant: self.variant.clone().unwrap_or_default(),
        }
    }
}

/// A command to execute on top of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    args: Vec<String>,
    ignore_cache: bool,
    custom_name: Option<String>,
}

impl ExecSpec {
    /// Split a command line into argv without involving a shell.
    pub fn shlex(command_line: &str) -> Result<Self> {
        let args = shell_words::split(command_line).map_err(|e| {
            ReproError::GraphBuild(format!("cannot split '{}': {}", command_line, e))
        })?;
        Self::from_args(args)
    }

    /// Run `script` through `/bin/sh -c`. The script becomes the display name.
    pub fn shell(script: &str) -> Result<Self> {
        if script.trim().is_empty() {
            return Err(ReproError::GraphBuild("empty shell script".to_string()));
        }
        Ok(Self {
            args: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ignore_cache: false,
            custom_name: Some(script.to_string()),
        })
    }

    pub fn from_args(args: Vec<String>) -> Result<Self> {
        if args.is_empty() || args[0].is_empty() {
            return Err(ReproError::GraphBuild("empty command line".to_string()));
        }
        Ok(Self {
            args,
            ignore_cache: false,
            custom_name: None,
        })
    }

    /// Bypass any cached result for this step.
    pub fn ignore_cache(mut self) -> Self {
        self.ignore_cache = true;
        self
    }

    pub fn custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Image { identifier: String },
    Exec { parent: Arc<Node>, args: Vec<String> },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    platform: Option<Platform>,
    ignore_cache: bool,
    custom_name: Option<String>,
}

/// Immutable handle on the head of a build graph.
#[derive(Debug, Clone)]
pub struct State {
    node: Arc<Node>,
}

impl State {
    /// Start from a registry image.
    pub fn image(reference: &str) -> Result<Self> {
        let normalized = normalize_reference(reference)?;
        Ok(Self {
            node: Arc::new(Node {
                kind: NodeKind::Image {
                    identifier: format!("docker-image://{}", normalized),
                },
                platform: None,
                ignore_cache: false,
                custom_name: None,
            }),
        })
    }

    /// Set the platform of the head op. Later exec ops inherit it.
    pub fn platform(self, platform: Platform) -> Self {
        self.map_head(|node| node.platform = Some(platform))
    }

    /// Bypass any cached result for the head op.
    pub fn ignore_cache(self) -> Self {
        self.map_head(|node| node.ignore_cache = true)
    }

    pub fn custom_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.map_head(|node| node.custom_name = Some(name))
    }

    /// Execute a command on the root filesystem of this state and
    /// return the resulting root.
    pub fn run(&self, exec: ExecSpec) -> State {
        State {
            node: Arc::new(Node {
                platform: self.node.platform.clone(),
                kind: NodeKind::Exec {
                    parent: Arc::clone(&self.node),
                    args: exec.args,
                },
                ignore_cache: exec.ignore_cache,
                custom_name: exec.custom_name,
            }),
        }
    }

    fn map_head(mut self, f: impl FnOnce(&mut Node)) -> Self {
        f(Arc::make_mut(&mut self.node));
        self
    }

    /// Serialize the graph.
    pub fn marshal(&self) -> Result<Marshaled> {
        let mut out = Marshaled::default();
        let head = marshal_node(&self.node, &mut out)?;

        let terminal = pb::Op {
            inputs: vec![pb::Input {
                digest: head.clone(),
                index: 0,
            }],
            op: None,
            platform: None,
        };
        let bytes = encode_op(&terminal)?;
        out.definition.def.push(bytes);
        out.head = head;
        Ok(out)
    }
}

/// A vertex of a marshaled graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshaledVertex {
    pub digest: String,
    /// Display name buildkitd will report for the vertex.
    pub name: String,
}

/// Result of [`State::marshal`].
#[derive(Debug, Clone, Default)]
pub struct Marshaled {
    pub definition: pb::Definition,
    /// Non-terminal vertices in definition order.
    pub vertices: Vec<MarshaledVertex>,
    /// Digest of the head op.
    pub head: String,
}

impl Marshaled {
    /// Find a vertex by its display name.
    pub fn vertex_named(&self, name: &str) -> Option<&MarshaledVertex> {
        self.vertices.iter().find(|v| v.name == name)
    }
}

fn marshal_node(node: &Node, out: &mut Marshaled) -> Result<String> {
    let (op, default_name) = match &node.kind {
        NodeKind::Image { identifier } => (
            pb::Op {
                inputs: Vec::new(),
                op: Some(pb::op::Op::Source(pb::SourceOp {
                    identifier: identifier.clone(),
                    attrs: BTreeMap::new(),
                })),
                platform: node.platform.as_ref().map(Platform::to_pb),
            },
            identifier.clone(),
        ),
        NodeKind::Exec { parent, args } => {
            let parent_digest = marshal_node(parent, out)?;
            let op = pb::Op {
                inputs: vec![pb::Input {
                    digest: parent_digest,
                    index: 0,
                }],
                op: Some(pb::op::Op::Exec(pb::ExecOp {
                    meta: Some(pb::Meta {
                        args: args.clone(),
                        env: vec![DEFAULT_PATH_ENV.to_string()],
                        cwd: "/".to_string(),
                        user: String::new(),
                    }),
                    mounts: vec![pb::Mount {
                        input: 0,
                        selector: String::new(),
                        dest: "/".to_string(),
                        output: 0,
                        readonly: false,
                    }],
                })),
                platform: node.platform.as_ref().map(Platform::to_pb),
            };
            (op, args.join(" "))
        }
    };

    let bytes = encode_op(&op)?;
    let digest = digest_of(&bytes);

    if out.vertices.iter().any(|v| v.digest == digest) {
        return Ok(digest);
    }

    if node.ignore_cache || node.custom_name.is_some() {
        let mut description = BTreeMap::new();
        if let Some(name) = &node.custom_name {
            description.insert(CUSTOM_NAME_KEY.to_string(), name.clone());
        }
        out.definition.metadata.insert(
            digest.clone(),
            pb::OpMetadata {
                ignore_cache: node.ignore_cache,
                description,
            },
        );
    }

    out.definition.def.push(bytes);
    out.vertices.push(MarshaledVertex {
        digest: digest.clone(),
        name: node.custom_name.clone().unwrap_or(default_name),
    });
    Ok(digest)
}

fn encode_op(op: &pb::Op) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(op.encoded_len());
    op.encode(&mut buf)?;
    Ok(buf)
}

/// `sha256:<hex>` content digest.
pub fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Expand a short image reference to its fully qualified form.
///
/// - `alpine` → `docker.io/library/alpine:latest`
/// - `user/app:1` → `docker.io/user/app:1`
/// - `localhost:5000/ns/dummy:test` → unchanged
pub fn normalize_reference(reference: &str) -> Result<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(ReproError::GraphBuild("empty image reference".to_string()));
    }

    let (name_tag, digest) = match reference.split_once('@') {
        Some((n, d)) => (n, Some(d)),
        None => (reference, None),
    };

    // A colon after the last slash separates the tag.
    let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    let (name, tag) = match name_tag[last_slash..].rfind(':') {
        Some(pos) => (
            &name_tag[..last_slash + pos],
            Some(&name_tag[last_slash + pos + 1..]),
        ),
        None => (name_tag, None),
    };
    if name.is_empty() || tag == Some("") {
        return Err(ReproError::GraphBuild(format!(
            "invalid image reference '{}'",
            reference
        )));
    }

    let qualified = match name.split_once('/') {
        Some((first, _))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            name.to_string()
        }
        Some(_) => format!("{}/{}", DEFAULT_REGISTRY, name),
        None => format!("{}/library/{}", DEFAULT_REGISTRY, name),
    };

    let mut normalized = qualified;
    match (tag, digest) {
        (Some(tag), _) => {
            normalized.push(':');
            normalized.push_str(tag);
        }
        (None, None) => {
            normalized.push(':');
            normalized.push_str(DEFAULT_TAG);
        }
        (None, Some(_)) => {}
    }
    if let Some(digest) = digest {
        normalized.push('@');
        normalized.push_str(digest);
    }
    Ok(normalized)
}
