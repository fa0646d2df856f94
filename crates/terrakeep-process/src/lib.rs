use specta::Type;

/// Unique identifier of one supervised server instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of the supervised process.
///
/// `Failed` is reached when the process output closes without a stop request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type,
)]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServerState {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct Player {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ChatMessage {
    pub author: String,
    pub text: String,
    pub at_unix_ms: u64,
}

/// Values announced by the server itself. Each field has a single writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerMetadata {
    pub seed: Option<String>,
    pub password: Option<String>,
    pub version: Option<String>,
    pub motd: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct QueueOccupancy {
    pub current: u32,
    pub max: u32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerStatus {
    pub id: ServerId,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub players: u32,
    pub queue: QueueOccupancy,
}
