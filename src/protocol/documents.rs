//! Open-document bookkeeping for the engine.

use log::debug;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::client::ProtocolClient;
use super::lsp::{did_change, did_close, did_open};
use crate::error::Result;
use crate::workspace::{content_hash, is_c_file};

#[derive(Debug, Clone)]
struct OpenDocument {
    version: i32,
    hash: String,
}

/// Files the engine currently has open, capped with least-recently-used eviction.
///
/// The lock is held across the notifications so that a query can never reach
/// the engine before the `didOpen` it depends on.
pub struct DocumentTracker {
    open: Mutex<LruCache<PathBuf, OpenDocument>>,
}

impl DocumentTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            open: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Make sure the engine sees the current content of `path`.
    pub async fn ensure_open(&self, client: &ProtocolClient, path: &Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let hash = content_hash(&bytes);
        let text = String::from_utf8_lossy(&bytes);

        let mut open = self.open.lock().await;
        let known = open.get(path).map(|doc| (doc.hash == hash, doc.version));
        if let Some((unchanged, version)) = known {
            if unchanged {
                return Ok(());
            }
            let version = version + 1;
            debug!("re-syncing {} (v{version})", path.display());
            if let Err(err) = client
                .notify("textDocument/didChange", did_change(path, version, &text))
                .await
            {
                // The engine's copy is unknown now; the next call reopens.
                open.pop(path);
                return Err(err);
            }
            open.put(path.to_path_buf(), OpenDocument { version, hash });
            return Ok(());
        }

        if open.len() == open.cap().get() {
            if let Some((evicted, _)) = open.pop_lru() {
                debug!("closing least recently used {}", evicted.display());
                client
                    .notify("textDocument/didClose", did_close(&evicted))
                    .await?;
            }
        }
        let language = if is_c_file(path) { "c" } else { "cpp" };
        client
            .notify("textDocument/didOpen", did_open(path, language, 1, &text))
            .await?;
        open.put(path.to_path_buf(), OpenDocument { version: 1, hash });
        Ok(())
    }

    pub async fn is_open(&self, path: &Path) -> bool {
        self.open.lock().await.contains(path)
    }

    pub async fn len(&self) -> usize {
        self.open.lock().await.len()
    }

    /// Forget everything; used when a fresh engine process is attached.
    pub async fn reset(&self) {
        self.open.lock().await.clear();
    }

    pub async fn close_all(&self, client: &ProtocolClient) {
        let mut open = self.open.lock().await;
        while let Some((path, _)) = open.pop_lru() {
            if let Err(err) = client.notify("textDocument/didClose", did_close(&path)).await {
                debug!("didClose for {} failed: {err}", path.display());
                break;
            }
        }
        open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::client::tests::{options, pipe};
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_once_resyncs_on_change_and_evicts_lru() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a.cpp");
        let b = temp.path().join("b.cpp");
        let c = temp.path().join("c.c");
        for file in [&a, &b, &c] {
            fs::write(file, "int x;\n").unwrap();
        }

        let client = ProtocolClient::new(options(temp.path()));
        let (r, w, mut server) = pipe();
        let attach = {
            let client = client.clone();
            tokio::spawn(async move { client.attach(r, w).await })
        };
        server.handshake().await;
        attach.await.unwrap().unwrap();

        let docs = DocumentTracker::new(2);
        docs.ensure_open(&client, &a).await.unwrap();
        docs.ensure_open(&client, &a).await.unwrap();
        docs.ensure_open(&client, &b).await.unwrap();

        let open_a = server.next().await.unwrap();
        assert_eq!(open_a["method"], "textDocument/didOpen");
        assert_eq!(open_a["params"]["textDocument"]["languageId"], "cpp");
        let open_b = server.next().await.unwrap();
        assert_eq!(open_b["method"], "textDocument/didOpen");

        fs::write(&a, "int x;\n ").unwrap();
        docs.ensure_open(&client, &a).await.unwrap();
        let change = server.next().await.unwrap();
        assert_eq!(change["method"], "textDocument/didChange");
        assert_eq!(change["params"]["textDocument"]["version"], json!(2));

        // b is now least recently used
        docs.ensure_open(&client, &c).await.unwrap();
        let close = server.next().await.unwrap();
        assert_eq!(close["method"], "textDocument/didClose");
        assert!(close["params"]["textDocument"]["uri"]
            .as_str()
            .unwrap()
            .ends_with("/b.cpp"));
        let open_c = server.next().await.unwrap();
        assert_eq!(open_c["params"]["textDocument"]["languageId"], "c");

        assert_eq!(docs.len().await, 2);
        assert!(docs.is_open(&a).await);
        assert!(!docs.is_open(&b).await);
    }

    #[tokio::test]
    async fn failed_change_is_resent_on_the_next_call() {
        let temp = tempdir().unwrap();
        let a = temp.path().join("a.cpp");
        fs::write(&a, "int x;\n").unwrap();

        let client = ProtocolClient::new(options(temp.path()));
        let (r, w, mut server) = pipe();
        let attach = {
            let client = client.clone();
            tokio::spawn(async move { client.attach(r, w).await })
        };
        server.handshake().await;
        attach.await.unwrap().unwrap();

        let docs = DocumentTracker::new(4);
        docs.ensure_open(&client, &a).await.unwrap();
        assert_eq!(server.next().await.unwrap()["method"], "textDocument/didOpen");

        fs::write(&a, "int x = 1;\n").unwrap();
        client.mark_unavailable("test");
        assert!(docs.ensure_open(&client, &a).await.is_err());
        assert!(!docs.is_open(&a).await);

        let (r, w, mut server) = pipe();
        let attach = {
            let client = client.clone();
            tokio::spawn(async move { client.attach(r, w).await })
        };
        server.handshake().await;
        attach.await.unwrap().unwrap();

        docs.ensure_open(&client, &a).await.unwrap();
        let resent = server.next().await.unwrap();
        assert_eq!(resent["method"], "textDocument/didOpen");
        assert_eq!(resent["params"]["textDocument"]["text"], "int x = 1;\n");
        assert!(docs.is_open(&a).await);

        // unchanged content is not sent again
        docs.ensure_open(&client, &a).await.unwrap();
        assert_eq!(docs.len().await, 1);
    }
}
