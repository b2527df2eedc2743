use serde::{Deserialize, Serialize};

/// Notification channels a client can subscribe to (bitmask).
pub const SUBS_SERVER: u32 = 1;
pub const SUBS_STATUS: u32 = 2;
pub const SUBS_CFG: u32 = 4;

/// Pseudo status codes used only on the STATUS notification channel.
pub const STATUS_CREATE: i64 = 4;
pub const STATUS_DELETE: i64 = 5;

/// Upper bound on instances per group.
pub const MAX_INSTANCES: i64 = 1024;

/// SIGTERM, the default kill signal for a group.
pub const DEFAULT_KILLSIG: i64 = 15;

/// Group supervision state. On the wire this is the bare integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum GroupStatus {
    Running = 1,
    Stopped = 2,
    Broken = 3,
}

impl GroupStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Parse the forms clients historically send: a symbolic name or a
    /// numeric code.
    pub fn parse_cli(s: &str) -> Option<GroupStatus> {
        match s {
            "start" => Some(GroupStatus::Running),
            "stop" => Some(GroupStatus::Stopped),
            "fatal" => Some(GroupStatus::Broken),
            _ => s.parse::<i64>().ok().and_then(|n| n.try_into().ok()),
        }
    }
}

impl From<GroupStatus> for i64 {
    fn from(s: GroupStatus) -> i64 {
        s.code()
    }
}

impl TryFrom<i64> for GroupStatus {
    type Error = String;

    fn try_from(n: i64) -> Result<GroupStatus, String> {
        match n {
            1 => Ok(GroupStatus::Running),
            2 => Ok(GroupStatus::Stopped),
            3 => Ok(GroupStatus::Broken),
            _ => Err(format!("invalid group status: {}", n)),
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupStatus::Running => write!(f, "running"),
            GroupStatus::Stopped => write!(f, "stopped"),
            GroupStatus::Broken => write!(f, "broken"),
        }
    }
}

/// A process group as it travels on the wire and in dump files: the SPWN
/// request body, the UPDT partial-update body, the GETC reply and the dump
/// array element are all this shape.
///
/// Every field is optional; unset fields are omitted when serializing.
/// Clients following the old convention may still send -1 for "unset" on
/// the integer fields — [`GroupSpec::normalize`] folds those to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Program and argv. Immutable after group creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_cb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groupname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killsig: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,
    /// Maximum uptime in seconds; 0 or unset means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<i64>,
    /// Recent-failure count. Only meaningful server -> client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<i64>,
}

impl GroupSpec {
    /// Fold legacy -1 "unset" sentinels into `None`.
    pub fn normalize(&mut self) {
        for field in [
            &mut self.instances,
            &mut self.status,
            &mut self.killsig,
            &mut self.uid,
            &mut self.gid,
            &mut self.error,
        ] {
            if *field == Some(-1) {
                *field = None;
            }
        }
    }

    /// Fill the defaults a group needs to operate. Applied when creating a
    /// group (SPWN) and when loading a dump — never by deserialization
    /// itself, so a partial UPDT body stays partial.
    pub fn apply_defaults(&mut self) {
        self.instances.get_or_insert(1);
        self.status.get_or_insert(GroupStatus::Running.code());
        self.killsig.get_or_insert(DEFAULT_KILLSIG);
    }
}

/// Generic `{code, msg}` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub code: bool,
    pub msg: String,
}

impl StatusReply {
    pub fn ok(msg: &str) -> StatusReply {
        StatusReply { code: true, msg: msg.to_string() }
    }

    pub fn fail(msg: &str) -> StatusReply {
        StatusReply { code: false, msg: msg.to_string() }
    }
}

/// Reply carrying the pids a command touched (KILL, DELE, PIDS).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsReply {
    pub code: bool,
    pub pids: Vec<i32>,
}

/// Body of commands that only name a group (DELE, GETC, PIDS).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KillRequest {
    pub name: String,
    /// Signal to deliver; the group's killsig when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<i64>,
    /// Restrict delivery to one instance slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadRequest {
    pub name: String,
    /// 1 = stdout log, 2 = stderr log.
    pub stream: i64,
    pub instance: i64,
    /// Carried as a double so offsets past 2^31 survive JSON.
    pub offset: f64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadReply {
    pub code: bool,
    pub log: String,
    pub offset: f64,
    pub fsize: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscribeRequest {
    /// Bitmask of SUBS_* channels.
    pub ident: i64,
}

/// STATUS channel event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub name: String,
    pub status: i64,
}

/// SERVER_LOG channel event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted() {
        let spec = GroupSpec {
            name: Some("web".to_string()),
            args: Some(vec!["/bin/sleep".to_string(), "60".to_string()]),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"name":"web","args":["/bin/sleep","60"]}"#);
    }

    #[test]
    fn round_trip_preserves_set_fields() {
        let spec = GroupSpec {
            name: Some("db".to_string()),
            args: Some(vec!["/usr/bin/redis".to_string()]),
            dir: Some("/var/db".to_string()),
            stdout: Some("/tmp/out.%(NUM)".to_string()),
            stderr: Some("/tmp/err.%(NUM)".to_string()),
            heartbeat: Some("/bin/hb".to_string()),
            fatal_cb: Some("/bin/fatal".to_string()),
            username: Some("nobody".to_string()),
            groupname: Some("nogroup".to_string()),
            instances: Some(3),
            status: Some(1),
            killsig: Some(9),
            uid: Some(65534),
            gid: Some(65534),
            age: Some(120),
            error: Some(0),
        };
        let json = serde_json::to_string(&spec).unwrap();
        let back: GroupSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn absent_deserializes_as_unset() {
        let spec: GroupSpec = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(spec.name.as_deref(), Some("x"));
        assert!(spec.instances.is_none());
        assert!(spec.status.is_none());
        assert!(spec.args.is_none());
    }

    #[test]
    fn normalize_folds_sentinels() {
        let mut spec: GroupSpec =
            serde_json::from_str(r#"{"name":"x","instances":-1,"uid":-1,"killsig":9}"#).unwrap();
        spec.normalize();
        assert!(spec.instances.is_none());
        assert!(spec.uid.is_none());
        assert_eq!(spec.killsig, Some(9));
    }

    #[test]
    fn defaults_fill_only_unset() {
        let mut spec: GroupSpec =
            serde_json::from_str(r#"{"name":"x","instances":4}"#).unwrap();
        spec.apply_defaults();
        assert_eq!(spec.instances, Some(4));
        assert_eq!(spec.status, Some(1));
        assert_eq!(spec.killsig, Some(DEFAULT_KILLSIG));
    }

    #[test]
    fn status_codes_round_trip() {
        for s in [GroupStatus::Running, GroupStatus::Stopped, GroupStatus::Broken] {
            assert_eq!(GroupStatus::try_from(s.code()).unwrap(), s);
        }
        assert!(GroupStatus::try_from(0).is_err());
        assert!(GroupStatus::try_from(4).is_err());
    }

    #[test]
    fn status_serializes_as_integer() {
        let json = serde_json::to_string(&GroupStatus::Broken).unwrap();
        assert_eq!(json, "3");
        let back: GroupStatus = serde_json::from_str("2").unwrap();
        assert_eq!(back, GroupStatus::Stopped);
    }

    #[test]
    fn status_parse_cli_forms() {
        assert_eq!(GroupStatus::parse_cli("start"), Some(GroupStatus::Running));
        assert_eq!(GroupStatus::parse_cli("stop"), Some(GroupStatus::Stopped));
        assert_eq!(GroupStatus::parse_cli("fatal"), Some(GroupStatus::Broken));
        assert_eq!(GroupStatus::parse_cli("2"), Some(GroupStatus::Stopped));
        assert_eq!(GroupStatus::parse_cli("7"), None);
        assert_eq!(GroupStatus::parse_cli("bogus"), None);
    }

    #[test]
    fn status_reply_shapes() {
        let ok = serde_json::to_string(&StatusReply::ok("success")).unwrap();
        assert_eq!(ok, r#"{"code":true,"msg":"success"}"#);
        let fail = serde_json::to_string(&StatusReply::fail("failure")).unwrap();
        assert_eq!(fail, r#"{"code":false,"msg":"failure"}"#);
    }

    #[test]
    fn kill_request_optional_fields() {
        let req: KillRequest = serde_json::from_str(r#"{"name":"s"}"#).unwrap();
        assert!(req.sig.is_none());
        assert!(req.index.is_none());
        let req: KillRequest =
            serde_json::from_str(r#"{"name":"s","sig":9,"index":2}"#).unwrap();
        assert_eq!(req.sig, Some(9));
        assert_eq!(req.index, Some(2));
    }

    #[test]
    fn read_request_accepts_integer_offset() {
        // Clients may send the offset as a JSON integer; it still lands in
        // the double-typed field.
        let req: ReadRequest = serde_json::from_str(
            r#"{"name":"s","stream":1,"instance":0,"offset":5,"bytes":100}"#,
        )
        .unwrap();
        assert_eq!(req.offset, 5.0);
    }
}
