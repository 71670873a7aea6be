use super::HealthProbe;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

/// Shell-command probe; a zero exit means healthy.
pub struct CommandProbe {
    cmd: String,
    envs: Vec<(String, String)>,
}

impl CommandProbe {
    pub fn new(cmd: String, envs: Vec<(String, String)>) -> Self {
        Self { cmd, envs }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self) -> bool {
        let mut command = Command::new("/bin/bash");
        command.arg("-c").arg("--").arg(&self.cmd);
        command.env_clear();
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        match command.status().await {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn describe(&self) -> String {
        self.cmd.clone()
    }
}
