//! In-memory host for tests.
//!
//! Records every command and answers from a list of substring rules, so
//! orchestration logic can be exercised without processes or machines.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ExecutorHandle, Host, HostError, HostResult, ProcessControl};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(String),
    Fail { exit_code: i32, stderr: String },
    Transport,
}

impl Reply {
    pub(crate) fn fail(stderr: &str) -> Self {
        Reply::Fail {
            exit_code: 1,
            stderr: stderr.to_string(),
        }
    }
}

struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

pub(crate) struct ScriptedHost {
    name: String,
    storage_root: PathBuf,
    ips: Vec<String>,
    log: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedHost {
    pub(crate) fn new(name: &str, ip: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_root: PathBuf::from("/srv/bench"),
            ips: vec![ip.to_string()],
            log: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Answers every command containing `pattern` with `reply`.
    pub(crate) fn on(&self, pattern: &str, reply: Reply) {
        self.push_rule(pattern, reply, None);
    }

    /// Answers the next `times` commands containing `pattern` with `reply`.
    pub(crate) fn on_times(&self, pattern: &str, reply: Reply, times: usize) {
        self.push_rule(pattern, reply, Some(times));
    }

    fn push_rule(&self, pattern: &str, reply: Reply, remaining: Option<usize>) {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
    }

    /// All commands seen so far; background commands are prefixed with `&`.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    fn reply_for(&self, cmd: &str) -> Option<Reply> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| cmd.contains(&r.pattern) && r.remaining != Some(0))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.reply.clone())
    }
}

#[async_trait]
impl Host for ScriptedHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    async fn run_sync(&self, cmd: &str) -> HostResult<String> {
        self.log.lock().unwrap().push(cmd.to_string());

        match self.reply_for(cmd) {
            Some(Reply::Ok(out)) => Ok(out),
            Some(Reply::Fail { exit_code, stderr }) => Err(HostError::CommandExecution {
                command: cmd.to_string(),
                exit_code,
                stdout: String::new(),
                stderr,
            }),
            Some(Reply::Transport) => Err(HostError::Transport {
                host: self.name.clone(),
                reason: "connection reset".to_string(),
            }),
            None if cmd.starts_with("ip -o addr show") => Ok(self
                .ips
                .iter()
                .enumerate()
                .map(|(i, ip)| format!("{}: eth{}    inet {}/24 scope global", i + 2, i, ip))
                .collect::<Vec<_>>()
                .join("\n")),
            None => Ok(String::new()),
        }
    }

    async fn run_async(&self, cmd: &str) -> HostResult<ExecutorHandle> {
        self.log.lock().unwrap().push(format!("&{}", cmd));
        if let Some(Reply::Transport) = self.reply_for(cmd) {
            return Err(HostError::Transport {
                host: self.name.clone(),
                reason: "connection reset".to_string(),
            });
        }

        Ok(ExecutorHandle::spawn(
            self.name.clone(),
            4242,
            Box::new(ScriptedControl::default()),
            tokio::io::empty(),
            tokio::io::empty(),
        ))
    }
}

#[derive(Default)]
struct ScriptedControl {
    dead: Arc<AtomicBool>,
}

#[async_trait]
impl ProcessControl for ScriptedControl {
    async fn terminate(&self, _pid: u32) -> HostResult<()> {
        self.dead.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self, _pid: u32) -> HostResult<bool> {
        Ok(!self.dead.load(Ordering::SeqCst))
    }

    async fn wait(&self) -> HostResult<i32> {
        self.dead.store(true, Ordering::SeqCst);
        Ok(0)
    }
}
