//! Run the command stored in an image label (e.g. `INSTALL`, `RUN`).

use std::collections::HashMap;
use std::sync::Arc;

use stevedore_core::config::PullPolicy;
use stevedore_core::error::{ImageError, Result};

use crate::changes::shell_words;
use crate::pull::ImagePuller;
use crate::reference::ImageReference;
use crate::registry::RegistryOptions;

/// A runlabel invocation.
#[derive(Debug, Clone, Default)]
pub struct RunlabelRequest {
    pub image: String,
    pub label: String,
    /// Container name substituted for `NAME`; defaults to the image's base name
    pub name: String,
    /// Pull the image if it is not stored
    pub pull: bool,
    pub registry: RegistryOptions,
    pub extra_args: Vec<String>,
    /// Extra variables exported to the command's environment
    pub opts: HashMap<String, String>,
}

/// A resolved label command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunlabelCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct Runlabel {
    puller: Arc<ImagePuller>,
}

impl Runlabel {
    pub fn new(puller: Arc<ImagePuller>) -> Self {
        Self { puller }
    }

    /// Resolve the label's command. `None` when the image has no such label.
    pub async fn resolve(&self, req: &RunlabelRequest) -> Result<Option<RunlabelCommand>> {
        if req.label.is_empty() {
            return Err(ImageError::InvalidArgument("Label name is required".to_string()));
        }
        let policy = if req.pull {
            PullPolicy::IfMissing
        } else {
            PullPolicy::Never
        };
        let record = self.puller.ensure(&req.image, policy, &req.registry).await?;

        let label = match record.labels.get(&req.label) {
            Some(value) if !value.trim().is_empty() => value.clone(),
            _ => {
                tracing::debug!(image = %req.image, label = %req.label, "Image has no such label");
                return Ok(None);
            }
        };
        let image_name = record
            .names
            .first()
            .cloned()
            .unwrap_or_else(|| req.image.clone());
        generate_command(&label, &image_name, &req.name, &req.opts, &req.extra_args).map(Some)
    }

    /// Resolve and run the label's command with inherited stdio.
    pub async fn run(&self, req: &RunlabelRequest) -> Result<()> {
        let Some(cmd) = self.resolve(req).await? else {
            return Ok(());
        };
        tracing::info!(program = %cmd.program, args = ?cmd.args, "Running label command");

        let status = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()
            .await
            .map_err(|e| ImageError::Other(format!("Failed to run {}: {}", cmd.program, e)))?;
        if !status.success() {
            return Err(ImageError::Other(format!(
                "{} exited with {}",
                cmd.program, status
            )));
        }
        Ok(())
    }
}

/// Substitute `IMAGE`, `NAME` and option variables into a label value and
/// split it into a program and arguments.
pub fn generate_command(
    label: &str,
    image_name: &str,
    name: &str,
    opts: &HashMap<String, String>,
    extra_args: &[String],
) -> Result<RunlabelCommand> {
    let name = if name.is_empty() {
        default_name(image_name)
    } else {
        name.to_string()
    };

    let mut words = shell_words(label).into_iter().map(|word| {
        let mut word = word
            .replace("$IMAGE", image_name)
            .replace("IMAGE", image_name)
            .replace("$NAME", &name)
            .replace("NAME", &name);
        for (key, value) in opts {
            word = word.replace(&format!("${}", key), value);
        }
        word
    });

    let program = words
        .next()
        .ok_or_else(|| ImageError::InvalidArgument("Label command is empty".to_string()))?;
    let program = if program == "docker" {
        "stevedore".to_string()
    } else {
        program
    };
    let mut args: Vec<String> = words.collect();
    args.extend(extra_args.iter().cloned());

    let mut env = vec![
        ("NAME".to_string(), name.clone()),
        ("IMAGE".to_string(), image_name.to_string()),
    ];
    let mut opt_keys: Vec<&String> = opts.keys().collect();
    opt_keys.sort();
    for key in opt_keys {
        env.push((key.clone(), opts[key].clone()));
    }

    Ok(RunlabelCommand { program, args, env })
}

/// Repository base name of an image, e.g. `nginx` for `docker.io/library/nginx:1`.
fn default_name(image_name: &str) -> String {
    match ImageReference::parse(image_name) {
        Ok(r) => r
            .repository
            .rsplit('/')
            .next()
            .unwrap_or(&r.repository)
            .to_string(),
        Err(_) => image_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_substitutes_image_and_name() {
        let cmd = generate_command(
            "docker run --name NAME -v /etc:/host IMAGE /install.sh",
            "docker.io/library/tool:1",
            "",
            &HashMap::new(),
            &["--verbose".to_string()],
        )
        .unwrap();
        assert_eq!(cmd.program, "stevedore");
        assert_eq!(
            cmd.args,
            vec![
                "run",
                "--name",
                "tool",
                "-v",
                "/etc:/host",
                "docker.io/library/tool:1",
                "/install.sh",
                "--verbose"
            ]
        );
        assert!(cmd.env.contains(&("NAME".to_string(), "tool".to_string())));
    }

    #[test]
    fn test_generate_with_explicit_name_and_opts() {
        let mut opts = HashMap::new();
        opts.insert("OPT1".to_string(), "--privileged".to_string());
        let cmd = generate_command("sh -c \"echo $NAME\" $OPT1", "img:1", "box", &opts, &[])
            .unwrap();
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.args, vec!["-c", "echo box", "--privileged"]);
        assert!(cmd.env.contains(&("OPT1".to_string(), "--privileged".to_string())));
    }

    #[test]
    fn test_generate_empty_label() {
        assert!(generate_command("  ", "img", "", &HashMap::new(), &[]).is_err());
    }

    #[test]
    fn test_default_name() {
        assert_eq!(default_name("quay.io/org/tool:2"), "tool");
        assert_eq!(default_name("busybox"), "busybox");
    }
}
