//! In-memory stand-in for the podman adapter, scripted per container.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tunnel_manager::runtime::{ContainerRecord, Mount, Runtime, RuntimeError};

/// Which taxonomy entry a scripted failure should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    NotFound,
    Unavailable,
    Transient,
}

impl FailKind {
    fn to_error(self, detail: &str) -> RuntimeError {
        match self {
            FailKind::NotFound => RuntimeError::NotFound(detail.to_string()),
            FailKind::Unavailable => RuntimeError::Unavailable(detail.to_string()),
            FailKind::Transient => RuntimeError::Transient(detail.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    pub record: ContainerRecord,
    pub alive: bool,
    pub passwd: String,
    pub log: String,
    /// When set, the install script fails with this transient detail
    pub install_error: Option<String>,
    /// When set, every call touching this container fails
    pub error: Option<FailKind>,
}

#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    /// Recorded `exec_detached` invocations: (container, user, script)
    pub detached: Mutex<Vec<(String, String, String)>>,
}

pub const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\ndev:x:1000:1000:Dev:/home/dev:/bin/bash\n";

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_container(&self, id: &str, container: FakeContainer) {
        self.containers.lock().unwrap().insert(id.to_string(), container);
    }

    /// A running workspace container ready for bootstrap.
    pub fn add_running(&self, id: &str, name: &str) {
        let mut container = FakeContainer {
            alive: true,
            passwd: PASSWD.to_string(),
            ..Default::default()
        };
        container.record.id = id.to_string();
        container.record.name = name.to_string();
        container.record.image = "workspace:latest".to_string();
        container.record.status = "running".to_string();
        self.add_container(id, container);
    }

    pub fn set_alive(&self, id: &str, alive: bool) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.alive = alive;
        }
    }

    pub fn set_log(&self, id: &str, log: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.log = log.to_string();
        }
    }

    pub fn set_error(&self, id: &str, kind: Option<FailKind>) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.error = kind;
        }
    }

    pub fn set_label(&self, id: &str, key: &str, value: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.record.labels.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_mount(&self, id: &str, source: &str, destination: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.record.mounts.push(Mount {
                source: source.to_string(),
                destination: destination.to_string(),
            });
        }
    }

    pub fn detached_starts(&self) -> Vec<(String, String, String)> {
        self.detached.lock().unwrap().clone()
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        let Some(container) = containers.get(id) else {
            return Err(RuntimeError::NotFound(format!("no such container {id}")));
        };
        if let Some(kind) = container.error {
            return Err(kind.to_error("scripted failure"));
        }
        Ok(f(container))
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn exec(&self, container: &str, script: &str) -> Result<String, RuntimeError> {
        if script.contains("kill -0") {
            return self.with_container(container, |c| {
                if c.alive { "alive\n".to_string() } else { "dead\n".to_string() }
            });
        }
        if script.contains("uname -m") {
            return self.with_container(container, |c| c.install_error.clone())?.map_or(
                Ok("code CLI installed: 1.92.0\n".to_string()),
                |detail| Err(RuntimeError::Transient(detail)),
            );
        }
        // prepare, chown, bootstrap-log appends
        self.with_container(container, |_| String::new())
    }

    async fn exec_detached(
        &self,
        container: &str,
        user: &str,
        _env: &[(String, String)],
        script: &str,
    ) -> Result<(), RuntimeError> {
        self.with_container(container, |_| ())?;
        self.detached.lock().unwrap().push((
            container.to_string(),
            user.to_string(),
            script.to_string(),
        ));
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<ContainerRecord, RuntimeError> {
        self.with_container(container, |c| c.record.clone())
    }

    async fn list(&self, label_filter: &str) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let containers = self.containers.lock().unwrap();
        Ok(containers
            .values()
            .filter(|c| c.record.labels.contains_key(label_filter))
            .map(|c| c.record.clone())
            .collect())
    }

    async fn read_file(&self, container: &str, path: &str) -> Result<String, RuntimeError> {
        self.with_container(container, |c| {
            if path == "/etc/passwd" {
                c.passwd.clone()
            } else if path.ends_with(".log") {
                c.log.clone()
            } else {
                String::new()
            }
        })
    }
}

/// Scratch host dir standing in for the token bind mount.
pub fn scratch_token_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tunnel-manager-it-{tag}-{}",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn write_token(dir: &std::path::Path) {
    std::fs::create_dir_all(dir.join("cli")).unwrap();
    std::fs::write(dir.join("cli/token.json"), "{}").unwrap();
}
