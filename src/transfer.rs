//! Moves file content to and from the managed node.
//!
//! The communicator's upload primitive runs as the unprivileged session user
//! and there is no native remote-to-local copy at all, so both directions are
//! built from the primitives that do exist:
//!
//! * Uploads stage the bytes at a randomly named path under a well-known temp
//!   root, then relocate them with a (possibly privileged) `mv`. Data
//!   transfer stays unprivileged; placement goes through the command runner.
//!
//! * Downloads wrap a `cat` of the remote file between two unique sentinel
//!   markers inside one captured command and reconstruct the content from the
//!   lines between the markers.

use crate::action::Action;
use crate::context::ExecContext;
use crate::output::OutputSink;
use crate::run::{exec, quote, run};
use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Well-known root for staging uploads before their move into place.
const TEMP_ROOT: &str = "/tmp";

/// Returns a staging path with a cryptographically random, hex-encoded
/// suffix.
fn staging_path() -> String {
    format!("{TEMP_ROOT}/bosun-{}", Uuid::new_v4().simple())
}

/// Uploads `content` to `destination` on the managed node.
///
/// Ensures the destination's parent directory exists, stages the bytes at a
/// random temporary path as the session user, then moves them into place.
/// When the context enables sudo, the directory creation and the move run
/// privileged; the data transfer itself never does, because the upload
/// primitive may not support privilege escalation.
pub fn upload(ctx: &ExecContext, content: &[u8], destination: &str) -> Result<()> {
    stage_and_place(ctx, content, destination, false)
}

/// As [upload], but the uploaded file is executable.
pub fn upload_executable(ctx: &ExecContext, content: &[u8], destination: &str) -> Result<()> {
    stage_and_place(ctx, content, destination, true)
}

fn stage_and_place(
    ctx: &ExecContext,
    content: &[u8],
    destination: &str,
    executable: bool,
) -> Result<()> {
    if let Some(parent) = Path::new(destination).parent() {
        if !parent.as_os_str().is_empty() {
            run(
                ctx,
                &[format!("mkdir -p {}", quote(&parent.to_string_lossy()))],
            )
            .with_context(|| format!("failed to create parent directory for {destination}"))?;
        }
    }

    let staging = staging_path();
    if executable {
        ctx.communicator().upload_executable(&staging, content)
    } else {
        ctx.communicator().upload(&staging, content)
    }
    .with_context(|| format!("failed to upload {destination}"))?;

    run(
        ctx,
        &[format!("mv {} {}", quote(&staging), quote(destination))],
    )
    .with_context(|| format!("failed to move {staging} into place at {destination}"))?;

    Ok(())
}

/// Downloads a remote file by capturing `cat` output between two unique
/// sentinel markers.
///
/// Lines outside the markers are ordinary command chatter and are forwarded
/// to the exec output; lines between them are accumulated, newline-appended,
/// as the file's content.
///
/// # Known limitation
///
/// The reconstruction is line-oriented. Content that itself contains the
/// sentinel text, lacks a trailing newline, or is not text at all is not
/// transferred faithfully. The markers are freshly randomized per call, so a
/// collision requires the file to quote this very invocation's markers.
pub fn download(ctx: &ExecContext, remote_path: &str) -> Result<String> {
    let nonce = Uuid::new_v4().simple().to_string();
    let begin = format!("BOSUN_BEGIN_{nonce}");
    let end = format!("BOSUN_END_{nonce}");

    // One compound command, wrapped so a sudo prefix covers all of it.
    let pipeline = format!("echo {begin}; cat {}; echo {end}", quote(remote_path));
    let command = format!("sh -c {}", quote(&pipeline));

    let capture = CaptureSink::new(&begin, &end, ctx.exec_output());
    exec(ctx, &command, &capture)
        .with_context(|| format!("failed to download {remote_path}"))?;

    let (content, saw_begin) = capture.finish();
    if !saw_begin {
        bail!("download of {remote_path} produced no begin marker");
    }
    Ok(content)
}

/// Splits one captured command's output into file content (between the
/// markers) and ordinary chatter (everything else, forwarded to
/// `passthrough`).
struct CaptureSink<'a> {
    begin: &'a str,
    end: &'a str,
    passthrough: &'a dyn OutputSink,
    state: Mutex<CaptureState>,
}

#[derive(Default)]
struct CaptureState {
    content: String,
    inside: bool,
    saw_begin: bool,
}

impl<'a> CaptureSink<'a> {
    fn new(begin: &'a str, end: &'a str, passthrough: &'a dyn OutputSink) -> Self {
        CaptureSink {
            begin,
            end,
            passthrough,
            state: Mutex::new(CaptureState::default()),
        }
    }

    fn finish(self) -> (String, bool) {
        let state = self.state.into_inner().unwrap();
        (state.content, state.saw_begin)
    }
}

impl OutputSink for CaptureSink<'_> {
    fn line(&self, line: &str) {
        let mut state = self.state.lock().unwrap();
        if line == self.begin {
            state.inside = true;
            state.saw_begin = true;
        } else if line == self.end {
            state.inside = false;
        } else if state.inside {
            state.content.push_str(line);
            state.content.push('\n');
        } else {
            self.passthrough.line(line);
        }
    }
}

/// Renders `template` against `data` and uploads the result to `destination`.
///
/// Handlebars syntax: variable substitution (`{{name}}`) and conditional
/// blocks (`{{#if flag}}...{{/if}}`).
pub fn upload_template<T: Serialize>(
    ctx: &ExecContext,
    template: &str,
    data: &T,
    destination: &str,
) -> Result<()> {
    let rendered = render(template, data)?;
    upload(ctx, rendered.as_bytes(), destination)
}

fn render<T: Serialize>(template: &str, data: &T) -> Result<String> {
    Handlebars::new()
        .render_template(template, data)
        .context("failed to render template")
}

/// One templated file in a batch upload.
pub struct TemplateUpload<'a> {
    /// Human-readable description, announced on the exec output.
    pub description: &'a str,
    pub template: &'a str,
    pub destination: &'a str,
}

/// Renders and uploads several templates against one substitution payload.
pub fn upload_templates<T: Serialize>(
    ctx: &ExecContext,
    uploads: &[TemplateUpload],
    data: &T,
) -> Result<()> {
    for entry in uploads {
        ctx.exec_output()
            .line(&format!("uploading {} to {}", entry.description, entry.destination));
        upload_template(ctx, entry.template, data, entry.destination)
            .with_context(|| format!("failed to upload {}", entry.description))?;
    }
    Ok(())
}

/// Action that uploads fixed content to a destination path.
pub struct Upload {
    content: Vec<u8>,
    destination: String,
}

impl Upload {
    pub fn new(content: impl Into<Vec<u8>>, destination: impl Into<String>) -> Self {
        Upload {
            content: content.into(),
            destination: destination.into(),
        }
    }
}

impl Action for Upload {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        upload(ctx, &self.content, &self.destination)
    }
}

/// Action that renders a template against fixed data and uploads the result.
pub struct UploadTemplate<T: Serialize> {
    template: String,
    data: T,
    destination: String,
}

impl<T: Serialize> UploadTemplate<T> {
    pub fn new(template: impl Into<String>, data: T, destination: impl Into<String>) -> Self {
        UploadTemplate {
            template: template.into(),
            data,
            destination: destination.into(),
        }
    }
}

impl<T: Serialize> Action for UploadTemplate<T> {
    fn apply(&self, ctx: &mut ExecContext) -> Result<()> {
        upload_template(ctx, &self.template, &self.data, &self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{harness, harness_from, CommandScript, FakeCommunicator, Op};
    use serde_json::json;

    mod upload {
        use super::*;

        /// Uploading to a privileged path must produce an unprivileged data
        /// transfer to a temporary path followed by a privileged relocation,
        /// never a direct privileged upload.
        #[test]
        fn separates_transfer_from_placement() {
            let harness = harness_from(FakeCommunicator::new(), true);
            upload(&harness.context, b"contents", "/etc/kubernetes/admin.conf").unwrap();

            let ops = harness.communicator.ops();
            assert_eq!(3, ops.len());

            match &ops[0] {
                Op::Start(command) => assert_eq!("sudo mkdir -p /etc/kubernetes", command),
                other => panic!("expected mkdir but got {other:?}"),
            }

            let staging = match &ops[1] {
                Op::Upload(path, content) => {
                    assert!(path.starts_with("/tmp/bosun-"), "path: {path}");
                    assert_ne!("/etc/kubernetes/admin.conf", path);
                    assert_eq!(b"contents".to_vec(), *content);
                    path.clone()
                }
                other => panic!("expected an unprivileged upload but got {other:?}"),
            };

            match &ops[2] {
                Op::Start(command) => {
                    assert_eq!(
                        &format!("sudo mv {staging} /etc/kubernetes/admin.conf"),
                        command,
                    );
                }
                other => panic!("expected mv but got {other:?}"),
            }
        }

        #[test]
        fn staging_paths_are_unique() {
            let first = staging_path();
            let second = staging_path();
            assert_ne!(first, second);
        }

        #[test]
        fn executable_upload_uses_the_executable_primitive() {
            let harness = harness();
            upload_executable(&harness.context, b"#!/bin/sh\n", "/usr/local/bin/join.sh")
                .unwrap();

            assert!(harness
                .communicator
                .ops()
                .iter()
                .any(|op| matches!(op, Op::UploadExecutable(..))));
        }

        #[test]
        fn failed_move_is_an_error() {
            let harness = harness_from(
                FakeCommunicator::with_responder(|command| {
                    if command.starts_with("mv ") {
                        CommandScript::exit(1)
                    } else {
                        CommandScript::ok()
                    }
                }),
                false,
            );

            let error = upload(&harness.context, b"x", "/opt/file").unwrap_err();
            assert!(error.to_string().contains("failed to move"));
        }
    }

    mod download {
        use super::*;

        /// Extracts the randomized marker beginning at `prefix` from the
        /// issued command.
        fn marker(command: &str, prefix: &str) -> String {
            let start = command.find(prefix).expect("marker prefix not found");
            command[start..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect()
        }

        #[test]
        fn extracts_content_between_markers() {
            let harness = harness_from(
                FakeCommunicator::with_responder(|command| {
                    let begin = marker(command, "BOSUN_BEGIN_");
                    let end = marker(command, "BOSUN_END_");
                    CommandScript::ok()
                        .with_stdout(format!("pre\n{begin}\nline1\nline2\n{end}\npost\n"))
                }),
                false,
            );

            let content = download(&harness.context, "/etc/config").unwrap();
            assert_eq!("line1\nline2\n", content);

            // The chatter outside the markers still reaches the normal sink.
            assert_eq!(
                vec!["pre".to_string(), "post".to_string()],
                harness.exec_output.lines(),
            );
        }

        #[test]
        fn sudo_wraps_the_whole_pipeline() {
            let harness = harness_from(
                FakeCommunicator::with_responder(|command| {
                    let begin = marker(command, "BOSUN_BEGIN_");
                    let end = marker(command, "BOSUN_END_");
                    CommandScript::ok().with_stdout(format!("{begin}\n{end}\n"))
                }),
                true,
            );

            download(&harness.context, "/etc/shadow").unwrap();

            let command = harness.communicator.commands().pop().unwrap();
            assert!(command.starts_with("sudo sh -c "), "command: {command}");
        }

        #[test]
        fn missing_markers_is_an_error() {
            let harness = harness_from(
                FakeCommunicator::with_responder(|_| {
                    CommandScript::ok().with_stdout("no markers here\n")
                }),
                false,
            );

            let error = download(&harness.context, "/etc/config").unwrap_err();
            assert!(error.to_string().contains("no begin marker"));
        }

        #[test]
        fn failed_cat_is_an_error() {
            let harness = harness_from(
                FakeCommunicator::with_responder(|_| CommandScript::exit(1)),
                false,
            );

            let error = download(&harness.context, "/etc/missing").unwrap_err();
            assert!(error.to_string().contains("failed to download"));
        }
    }

    mod templates {
        use super::*;

        fn uploaded_bytes(harness: &crate::fixtures::Harness) -> Vec<u8> {
            harness
                .communicator
                .ops()
                .iter()
                .find_map(|op| match op {
                    Op::Upload(_, content) => Some(content.clone()),
                    _ => None,
                })
                .expect("no upload recorded")
        }

        #[test]
        fn substitutes_variables_and_conditionals() {
            let harness = harness();
            let data = json!({ "name": "node-1", "control_plane": true });

            upload_template(
                &harness.context,
                "node: {{name}}\n{{#if control_plane}}role: control-plane\n{{/if}}",
                &data,
                "/etc/cluster/node.conf",
            )
            .unwrap();

            assert_eq!(
                b"node: node-1\nrole: control-plane\n".to_vec(),
                uploaded_bytes(&harness),
            );
        }

        #[test]
        fn batch_uploads_announce_each_file() {
            let harness = harness();
            let data = json!({ "token": "abc123" });

            upload_templates(
                &harness.context,
                &[
                    TemplateUpload {
                        description: "join configuration",
                        template: "token: {{token}}\n",
                        destination: "/etc/cluster/join.conf",
                    },
                    TemplateUpload {
                        description: "kubelet drop-in",
                        template: "arg: {{token}}\n",
                        destination: "/etc/systemd/system/kubelet.conf.d/20-token.conf",
                    },
                ],
                &data,
            )
            .unwrap();

            assert!(harness.exec_output.contains("uploading join configuration"));
            assert!(harness.exec_output.contains("uploading kubelet drop-in"));

            let uploads = harness
                .communicator
                .ops()
                .iter()
                .filter(|op| matches!(op, Op::Upload(..)))
                .count();
            assert_eq!(2, uploads);
        }
    }
}
