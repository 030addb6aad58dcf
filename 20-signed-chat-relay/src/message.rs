use serde::{Deserialize, Serialize};

/// One protocol message. `type` selects the body shape; `ts` is present on
/// relay-originated envelopes and `tag` carries the MAC over everything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: Body,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Join {
        name: String,
    },
    Msg {
        // Filled in by the relay; whatever a client puts here is ignored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        text: String,
    },
    Leave,
    Cmd(Command),
    Sys {
        text: String,
    },
    Err {
        text: String,
    },
    List {
        users: Vec<String>,
    },
    Whisper {
        from: String,
        text: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    List,
    Whisper { to: String, text: String },
}

impl Envelope {
    /// Unsigned, untimestamped envelope, the shape clients send.
    pub fn new(body: Body) -> Self {
        Self {
            body,
            ts: None,
            tag: None,
        }
    }

    /// Unsigned envelope stamped with the current time, the shape the relay sends.
    pub fn stamped(body: Body) -> Self {
        Self {
            body,
            ts: Some(now_millis()),
            tag: None,
        }
    }

    pub fn join(name: impl Into<String>) -> Self {
        Self::new(Body::Join { name: name.into() })
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(Body::Msg {
            name: None,
            text: text.into(),
        })
    }

    pub fn leave() -> Self {
        Self::new(Body::Leave)
    }

    pub fn list_request() -> Self {
        Self::new(Body::Cmd(Command::List))
    }

    pub fn whisper_request(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Body::Cmd(Command::Whisper {
            to: to.into(),
            text: text.into(),
        }))
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::stamped(Body::Sys { text: text.into() })
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::stamped(Body::Err { text: text.into() })
    }

    /// Short name of the body's `type`, for logs.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            Body::Join { .. } => "join",
            Body::Msg { .. } => "msg",
            Body::Leave => "leave",
            Body::Cmd(_) => "cmd",
            Body::Sys { .. } => "sys",
            Body::Err { .. } => "err",
            Body::List { .. } => "list",
            Body::Whisper { .. } => "whisper",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
