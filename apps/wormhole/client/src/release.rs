//! Release metadata announced once per control connection.

use tracing::warn;
use wormhole_core::{Message, Release, MAX_FRAME_LEN};

/// Names of the environment variables a release is read from.
#[derive(Debug, Clone)]
pub struct ReleaseVars {
    pub id: String,
    pub description: String,
    pub branch: String,
}

pub fn from_env(vars: &ReleaseVars) -> Option<Release> {
    from_lookup(vars, |name| std::env::var(name).ok())
}

/// Builds a release when the id variable is set and non-empty.
pub fn from_lookup(vars: &ReleaseVars, lookup: impl Fn(&str) -> Option<String>) -> Option<Release> {
    let id = lookup(&vars.id).filter(|id| !id.trim().is_empty())?;
    let release = Release {
        id: id.trim().to_string(),
        description: lookup(&vars.description).unwrap_or_default(),
        branch: lookup(&vars.branch).unwrap_or_default(),
        ..Release::default()
    };
    Some(fit_frame(release))
}

/// Shortens the free-text fields until the `Release` frame fits in one
/// control read.
pub fn fit_frame(mut release: Release) -> Release {
    loop {
        let len = match Message::Release(release.clone()).pack() {
            Ok(bytes) => bytes.len(),
            Err(err) => {
                warn!(error = %err, "release does not encode, dropping free-text fields");
                release.description.clear();
                release.vcs_revision_message.clear();
                return release;
            }
        };
        if len <= MAX_FRAME_LEN {
            return release;
        }
        let excess = len - MAX_FRAME_LEN;
        let field = [
            &mut release.description,
            &mut release.vcs_revision_message,
            &mut release.author_name,
            &mut release.branch,
        ]
        .into_iter()
        .find(|field| !field.is_empty());
        match field {
            Some(field) => {
                let keep = field.len().saturating_sub(excess);
                truncate(field, keep);
            }
            None => {
                warn!(release_id = %release.id, "release id too long to announce");
                release.id.clear();
                return release;
            }
        }
    }
}

fn truncate(text: &mut String, max: usize) {
    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
