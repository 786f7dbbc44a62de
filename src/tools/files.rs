use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolDescriptor, required_str};
use crate::errors::ToolFailure;

/// `read_local_file`: read challenge files shipped next to the run, confined
/// to one directory.
pub struct ReadLocalFileTool {
    root: PathBuf,
    descriptor: ToolDescriptor,
}

impl ReadLocalFileTool {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let descriptor = ToolDescriptor::new(
            "read_local_file",
            format!(
                "Read a challenge file from the '{}' directory, e.g. source code provided with the challenge.",
                root.display()
            ),
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the files directory"}
                },
                "required": ["path"]
            }),
        );
        Self { root, descriptor }
    }

    /// Resolve `requested` inside the root. Absolute paths and `..` segments
    /// are rejected; a leading copy of the root directory name is accepted.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ToolFailure> {
        let requested = Path::new(requested.trim());
        let relative = requested.strip_prefix(&self.root).unwrap_or(requested);

        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(ToolFailure::execution(format!(
                "access denied: only files under '{}' can be read",
                self.root.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Tool for ReadLocalFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: &Value) -> Result<String, ToolFailure> {
        let path = self.resolve(required_str(args, "path")?)?;

        // symlinks must not lead out of the root either
        let (canonical, root) = match (
            tokio::fs::canonicalize(&path).await,
            tokio::fs::canonicalize(&self.root).await,
        ) {
            (Ok(p), Ok(r)) => (p, r),
            _ => {
                return Err(ToolFailure::execution(format!(
                    "file not found: {}",
                    path.display()
                )));
            }
        };
        if !canonical.starts_with(&root) {
            return Err(ToolFailure::execution(format!(
                "access denied: only files under '{}' can be read",
                self.root.display()
            )));
        }

        let bytes = tokio::fs::read(&canonical)
            .await
            .map_err(|e| ToolFailure::execution(format!("failed to read {}: {}", path.display(), e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
