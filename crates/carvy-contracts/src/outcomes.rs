use std::fmt;

use serde::{Deserialize, Serialize};

pub const CONFLICT_MESSAGE: &str = "A file with this name already exists.";

/// Terminal success states of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Cached {
        url: String,
    },
    Conflict {
        message: String,
        url: String,
    },
    Created {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        url: String,
    },
}

impl PipelineOutcome {
    pub fn conflict(url: impl Into<String>) -> Self {
        Self::Conflict {
            message: CONFLICT_MESSAGE.to_string(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Cached { url } | Self::Conflict { url, .. } | Self::Created { url, .. } => url,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Cached { .. } => "cached",
            Self::Conflict { .. } => "conflict",
            Self::Created { .. } => "created",
        }
    }
}

/// Working stages a request passes through before it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reading,
    Generating,
    Refining,
    Publishing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Generating => "generating",
            Self::Refining => "refining",
            Self::Publishing => "publishing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
