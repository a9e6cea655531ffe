//! External confirmation collaborator.
//!
//! Identities added with the confirm constraint require interactive
//! approval before each signature.  The approval itself is collected by an
//! out-of-process prompt program so the agent never grows UI code: the
//! program is invoked with the rendered prompt text (the `ssh-askpass`
//! convention: prompt as an argument, exit status 0 means approved) and
//! runs under `tokio::process`, so waiting on the user never blocks the
//! runtime or other connections.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// What a confirmation prompt is asking about.
#[derive(Debug, Clone)]
pub struct ConfirmRequest {
    pub fingerprint: String,
    pub comment: String,
}

/// Outcome of a confirmation round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    Denied,
}

/// Collects an interactive approval for a single signing operation.
#[async_trait::async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmRequest) -> Confirmation;
}

/// Runs an `ssh-askpass`-style program for each confirmation.
///
/// Argument templates may reference `{{message}}`, `{{comment}}`, and
/// `{{fingerprint}}`; the default argument list is just the rendered
/// message.  A cancelled dialog, a launch failure, or a timeout all count
/// as denial.
pub struct AskpassConfirmer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

/// How long the user gets to answer before the request is denied.
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

impl AskpassConfirmer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["{{message}}".to_string()],
            timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }

    /// Replace the argument template list.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl Confirmer for AskpassConfirmer {
    async fn confirm(&self, request: &ConfirmRequest) -> Confirmation {
        let message = format!(
            "Allow use of SSH key \"{}\" ({})?",
            request.comment, request.fingerprint
        );
        let values = [
            ("message", message.as_str()),
            ("comment", request.comment.as_str()),
            ("fingerprint", request.fingerprint.as_str()),
        ];
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| render_template(arg, &values))
            .collect();

        let mut child = match Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    program = %self.program.display(),
                    error = %e,
                    "confirmation prompt failed to launch; denying"
                );
                return Confirmation::Denied;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Err(_) => {
                warn!(
                    fingerprint = %request.fingerprint,
                    "confirmation prompt timed out; denying"
                );
                let _ = child.kill().await;
                Confirmation::Denied
            }
            Ok(Err(e)) => {
                warn!(error = %e, "confirmation prompt wait failed; denying");
                Confirmation::Denied
            }
            Ok(Ok(status)) if status.success() => {
                debug!(fingerprint = %request.fingerprint, "signing confirmed");
                Confirmation::Approved
            }
            Ok(Ok(status)) => {
                debug!(
                    fingerprint = %request.fingerprint,
                    code = status.code(),
                    "signing denied by prompt"
                );
                Confirmation::Denied
            }
        }
    }
}

/// Substitute `{{key}}` placeholders from `values`, leaving unknown
/// placeholders in place so a misconfigured template stays visible.
fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated placeholder; emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match values.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConfirmRequest {
        ConfirmRequest {
            fingerprint: "SHA256:abc".to_string(),
            comment: "work laptop".to_string(),
        }
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let out = render_template("{{comment}} ({{fingerprint}})", &[
            ("comment", "c"),
            ("fingerprint", "f"),
        ]);
        assert_eq!(out, "c (f)");
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let out = render_template("{{nope}}", &[("comment", "c")]);
        assert_eq!(out, "{{nope}}");
    }

    #[test]
    fn render_keeps_unterminated_placeholder_verbatim() {
        let out = render_template("ask {{comment", &[("comment", "c")]);
        assert_eq!(out, "ask {{comment");
    }

    #[tokio::test]
    async fn exit_zero_is_approval() {
        let confirmer = AskpassConfirmer::new("/bin/true");
        assert_eq!(confirmer.confirm(&request()).await, Confirmation::Approved);
    }

    #[tokio::test]
    async fn exit_nonzero_is_denial() {
        let confirmer = AskpassConfirmer::new("/bin/false");
        assert_eq!(confirmer.confirm(&request()).await, Confirmation::Denied);
    }

    #[tokio::test]
    async fn missing_program_is_denial() {
        let confirmer = AskpassConfirmer::new("/nonexistent/prompt-program");
        assert_eq!(confirmer.confirm(&request()).await, Confirmation::Denied);
    }

    #[tokio::test]
    async fn slow_program_times_out_to_denial() {
        let confirmer = AskpassConfirmer::new("/bin/sleep")
            .with_args(vec!["5".to_string()])
            .with_timeout(Duration::from_millis(50));
        assert_eq!(confirmer.confirm(&request()).await, Confirmation::Denied);
    }
}
