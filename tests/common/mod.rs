//! Shared helpers for the engine host integration tests
#![allow(dead_code)]

pub mod fake_library;
pub mod mock_server;

use query_engine_host::{EngineConfig, EngineRegistry};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const CLIENT_VERSION: &str = "5.0.0-test";

pub const SCHEMA: &str = r#"datasource db {
  provider = "sqlite"
  url      = "file:./dev.db"
}

model User {
  id    Int    @id @default(autoincrement())
  email String @unique
}
"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Registry private to one test so shutdown hooks never touch other engines
pub fn test_registry() -> &'static EngineRegistry {
    Box::leak(Box::new(EngineRegistry::new()))
}

/// Project directory holding a schema file
pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create project dir");
        std::fs::write(dir.path().join("schema.prisma"), SCHEMA).expect("write schema");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn schema_path(&self) -> PathBuf {
        self.dir.path().join("schema.prisma")
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            cwd: self.path().to_path_buf(),
            client_version: CLIENT_VERSION.to_string(),
            ..EngineConfig::new(self.schema_path())
        }
    }

    /// Config talking to an already running engine
    pub fn remote_config(&self, endpoint: &str) -> EngineConfig {
        EngineConfig {
            engine_endpoint: Some(endpoint.to_string()),
            ..self.config()
        }
    }

    /// Write an executable shell script standing in for the engine binary
    #[cfg(unix)]
    pub fn fake_binary(&self, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write fake engine");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("make fake engine executable");
        path
    }

    #[cfg(unix)]
    pub fn binary_config(&self, name: &str, script: &str) -> EngineConfig {
        EngineConfig {
            prisma_path: Some(self.fake_binary(name, script)),
            ..self.config()
        }
    }
}

/// Ready line the engine prints once its HTTP server listens
pub const READY_LINE: &str = r#"{"timestamp":"2024-01-01T00:00:00Z","level":"INFO","fields":{"message":"Started query engine http server on http://127.0.0.1:0"},"target":"query_engine::server"}"#;
