use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::compile::gateway::{MaterializeReport, PersistReport};
use crate::compile::process_registry::ProcessInfo;
use crate::compile::workflow::WorkflowSummary;
use crate::sandbox::{DirEntry, ExportFormat, FileTree, SpawnOptions};
use crate::server::tree_cache::TreeEntry;

/// Protocol version
/// v1: JSON text or MessagePack binary frames, `method`-tagged requests
pub const PROTOCOL_VERSION: u32 = 1;

/// 帧编码：文本帧为 JSON，二进制帧为 MessagePack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

impl Encoding {
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, String> {
        match self {
            Encoding::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            Encoding::MessagePack => rmp_serde::from_slice(data).map_err(|e| e.to_string()),
        }
    }

    pub fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, String> {
        match self {
            Encoding::Json => serde_json::to_vec(msg).map_err(|e| e.to_string()),
            // 使用 to_vec_named 确保输出字典格式（带字段名），而不是数组格式
            Encoding::MessagePack => rmp_serde::to_vec_named(msg).map_err(|e| e.to_string()),
        }
    }
}

fn default_root() -> String {
    "/".to_string()
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "getInfo")]
    GetInfo,

    // Filesystem
    #[serde(rename = "fs.mkdir")]
    FsMkdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "fs.readdir")]
    FsReaddir { path: String },
    #[serde(rename = "fs.readFile")]
    FsReadFile { path: String },
    #[serde(rename = "fs.writeFile")]
    FsWriteFile { path: String, data: String },
    #[serde(rename = "fs.rm")]
    FsRm {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "fs.rename")]
    FsRename { old_path: String, new_path: String },
    #[serde(rename = "fs.tree")]
    FsTree,

    // Whole tree
    #[serde(rename = "mount")]
    Mount {
        tree: FileTree,
        #[serde(default = "default_root")]
        mount_point: String,
    },
    #[serde(rename = "export")]
    Export {
        path: String,
        #[serde(default)]
        format: ExportFormat,
    },

    // Artifacts
    #[serde(rename = "loadArtifact")]
    LoadArtifact {
        artifact_id: String,
        #[serde(default = "default_root")]
        target_dir: String,
    },
    #[serde(rename = "publishArtifact")]
    PublishArtifact {
        source_dir: String,
        artifact_id: String,
        #[serde(default = "default_root")]
        target_dir: String,
    },

    // Processes
    #[serde(rename = "spawn")]
    Spawn {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    #[serde(rename = "spawnProcess")]
    SpawnProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        options: SpawnOptions,
    },
    #[serde(rename = "killProcess")]
    KillProcess { process_id: String },
    #[serde(rename = "listProcesses")]
    ListProcesses,
    #[serde(rename = "writeInput")]
    WriteInput { process_id: String, data: String },
    #[serde(rename = "resizeProcess")]
    ResizeProcess {
        process_id: String,
        cols: u16,
        rows: u16,
    },

    // Workflow
    #[serde(rename = "runBuild")]
    RunBuild {
        /// store-relative path → text; the built-in sample project when absent
        #[serde(default)]
        sources: Option<BTreeMap<String, String>>,
    },
}

/// Every method name accepted in `ClientMessage::method`.
pub const METHODS: &[&str] = &[
    "ping",
    "getInfo",
    "fs.mkdir",
    "fs.readdir",
    "fs.readFile",
    "fs.writeFile",
    "fs.rm",
    "fs.rename",
    "fs.tree",
    "mount",
    "export",
    "loadArtifact",
    "publishArtifact",
    "spawn",
    "spawnProcess",
    "killProcess",
    "listProcesses",
    "writeInput",
    "resizeProcess",
    "runBuild",
];

/// 请求信封：`id` 可选，存在时原样回显在响应中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: ClientMessage,
}

/// Just enough of a request to answer it when the full decode fails.
#[derive(Debug, Default, Deserialize)]
pub struct RequestStub {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

// ============================================================================
// Responses and events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub status: String,
    pub workdir: String,
    pub process_count: usize,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        version: u32,
        session_id: String,
        service: ServiceIdentity,
        capabilities: Vec<String>,
    },
    Pong,
    Info(ServiceStatus),

    DirCreated {
        path: String,
    },
    DirEntries {
        path: String,
        entries: Vec<DirEntry>,
    },
    FileContent {
        path: String,
        content: String,
    },
    FileWritten {
        path: String,
        bytes: usize,
    },
    Removed {
        path: String,
    },
    Renamed {
        old_path: String,
        new_path: String,
    },
    Tree {
        entries: Vec<TreeEntry>,
    },
    Mounted {
        mount_point: String,
    },
    Exported {
        path: String,
        format: ExportFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        tree: Option<FileTree>,
        /// base64，仅 binary 格式
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },

    ArtifactLoaded(MaterializeReport),
    ArtifactPublished(PersistReport),

    CommandCompleted {
        command: String,
        exit_code: i32,
        output: String,
    },
    ProcessSpawned(ProcessInfo),
    ProcessKilled {
        process_id: String,
    },
    Processes {
        processes: Vec<ProcessInfo>,
    },
    InputWritten {
        process_id: String,
        bytes: usize,
    },
    ProcessResized {
        process_id: String,
        cols: u16,
        rows: u16,
    },

    BuildCompleted(WorkflowSummary),

    // Pushed events
    ProcessOutput {
        process_id: String,
        data: String,
    },
    ProcessExited {
        process_id: String,
        exit_code: Option<i32>,
    },
    ServerReady {
        port: u16,
        url: String,
    },
    TreeChanged,

    Error {
        code: String,
        message: String,
    },
}

/// 响应信封：回显请求 `id`，推送事件没有 `id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: ServerMessage,
}

impl ResponseEnvelope {
    pub fn event(body: ServerMessage) -> Self {
        Self { id: None, body }
    }
}

pub fn capabilities() -> Vec<String> {
    vec![
        "fs".to_string(),
        "tree_cache".to_string(),
        "mount_export".to_string(),
        "artifacts".to_string(),
        "processes".to_string(),
        "terminal_processes".to_string(),
        "process_events".to_string(),
        "server_ready".to_string(),
        "build_workflow".to_string(),
        "msgpack".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::TreeNode;

    #[test]
    fn test_parse_requests() {
        let json = r#"{"id":"7","method":"fs.writeFile","path":"/a.txt","data":"hello"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("7"));
        match envelope.body {
            ClientMessage::FsWriteFile { path, data } => {
                assert_eq!(path, "/a.txt");
                assert_eq!(data, "hello");
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        let json = r#"{"method":"loadArtifact","artifact_id":"ws/app"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(json).unwrap();
        assert!(envelope.id.is_none());
        match envelope.body {
            ClientMessage::LoadArtifact {
                artifact_id,
                target_dir,
            } => {
                assert_eq!(artifact_id, "ws/app");
                assert_eq!(target_dir, "/");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_spawn_process_options() {
        let json = r#"{"method":"spawnProcess","command":"npm","args":["start"],"options":{"terminal":{"cols":80,"rows":24},"output":false}}"#;
        let envelope: RequestEnvelope = serde_json::from_str(json).unwrap();
        match envelope.body {
            ClientMessage::SpawnProcess {
                command,
                args,
                options,
            } => {
                assert_eq!(command, "npm");
                assert_eq!(args, vec!["start"]);
                assert!(!options.output);
                assert_eq!(options.terminal.map(|t| t.cols), Some(80));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_mount_tree() {
        let json = r#"{"method":"mount","tree":{"index.js":{"file":{"contents":"x"}}}}"#;
        let envelope: RequestEnvelope = serde_json::from_str(json).unwrap();
        match envelope.body {
            ClientMessage::Mount { tree, mount_point } => {
                assert_eq!(mount_point, "/");
                assert_eq!(tree["index.js"], TreeNode::file("x"));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_every_method_name_is_known() {
        for method in METHODS {
            let json = format!(r#"{{"method":"{}"}}"#, method);
            if let Err(e) = serde_json::from_str::<RequestEnvelope>(&json) {
                // 缺少参数可以，但不能是未知方法
                assert!(
                    !e.to_string().contains("unknown variant"),
                    "{} rejected: {}",
                    method,
                    e
                );
            }
        }
    }

    #[test]
    fn test_response_envelope_shape() {
        let response = ResponseEnvelope {
            id: Some("1".into()),
            body: ServerMessage::ProcessKilled {
                process_id: "proc_3".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"id": "1", "type": "process_killed", "process_id": "proc_3"})
        );

        let event = ResponseEnvelope::event(ServerMessage::TreeChanged);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "tree_changed"})
        );
    }

    #[test]
    fn test_msgpack_roundtrip_uses_named_fields() {
        let response = ResponseEnvelope {
            id: Some("9".into()),
            body: ServerMessage::ServerReady {
                port: 3111,
                url: "http://localhost:3111/".into(),
            },
        };
        let bytes = rmp_serde::to_vec_named(&response).unwrap();
        let decoded: ResponseEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.id.as_deref(), Some("9"));
        match decoded.body {
            ServerMessage::ServerReady { port, .. } => assert_eq!(port, 3111),
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
