use super::FirestoreConfig;
use super::TokenProvider as _;
use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;

/// Thin typed wrapper over the Firestore v1 REST surface: document get,
/// commit (optionally transactional), beginTransaction/rollback, and
/// runQuery. Paths passed in are relative to the database documents root,
/// e.g. `jobs/abc` or `jobs/abc/simulations/sim_000`.
#[derive(Clone)]
pub struct FirestoreClient {
    config: FirestoreConfig,
    http: reqwest::Client,
}

/// One decoded document: relative path plus its `fields` map.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub fields: Value,
}

impl FirestoreClient {
    pub fn new(config: FirestoreConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { config, http })
    }

    /// `projects/{p}/databases/{db}/documents`
    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.config.project_id, self.config.database
        )
    }

    /// Full resource name for a relative document path.
    pub fn resource_name(&self, path: &str) -> String {
        format!("{}/{path}", self.documents_root())
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.config.base_url, suffix)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        match self.config.token_provider.token().await? {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }

    fn strip_root<'a>(&self, name: &'a str) -> &'a str {
        let root = self.documents_root();
        name.strip_prefix(root.as_str())
            .map_or(name, |rest| rest.trim_start_matches('/'))
    }

    /// GET one document; `None` on 404. A transaction id pins the read to
    /// that transaction's snapshot.
    pub async fn get_document(
        &self,
        path: &str,
        transaction: Option<&str>,
    ) -> anyhow::Result<Option<Document>> {
        let mut request = self.http.get(self.url(&format!("{}/{path}", self.documents_root())));
        if let Some(transaction) = transaction {
            request = request.query(&[("transaction", transaction)]);
        }
        let response = self.authorize(request).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        let body: Value = response.json().await?;
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .context("document missing name")?;
        Ok(Some(Document {
            path: self.strip_root(name).to_string(),
            fields: body.get("fields").cloned().unwrap_or_else(|| json!({})),
        }))
    }

    pub async fn begin_transaction(&self) -> anyhow::Result<String> {
        let url = self.url(&format!("{}:beginTransaction", self.documents_root()));
        let response = self
            .authorize(self.http.post(url))
            .await?
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("transaction")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("beginTransaction response missing transaction id")
    }

    pub async fn rollback(&self, transaction: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("{}:rollback", self.documents_root()));
        self.authorize(self.http.post(url))
            .await?
            .json(&json!({ "transaction": transaction }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Commit a batch of writes, optionally inside a transaction. Returns
    /// false when the backend rejected it with ABORTED/409 (contention) or
    /// a failed precondition, which callers treat as a lost race.
    pub async fn commit(
        &self,
        writes: Vec<Value>,
        transaction: Option<&str>,
    ) -> anyhow::Result<bool> {
        let url = self.url(&format!("{}:commit", self.documents_root()));
        let mut body = json!({ "writes": writes });
        if let Some(transaction) = transaction {
            body["transaction"] = Value::String(transaction.to_string());
        }
        let response = self
            .authorize(self.http.post(url))
            .await?
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::CONFLICT {
            return Ok(false);
        }
        if status == StatusCode::BAD_REQUEST {
            // ABORTED surfaces as 400 with a status payload on some
            // emulator versions; inspect before failing hard.
            let body: Value = response.json().await.unwrap_or_default();
            let aborted = body
                .get("error")
                .and_then(|error| error.get("status"))
                .and_then(Value::as_str)
                .is_some_and(|code| code == "ABORTED" || code == "FAILED_PRECONDITION");
            if aborted {
                return Ok(false);
            }
            anyhow::bail!("firestore commit rejected: {body}");
        }
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("firestore commit failed ({status}): {body}")
    }

    /// Structured query under `parent` (empty for the documents root).
    /// Returns decoded documents; rows without a document (cursor-only
    /// responses) are skipped.
    pub async fn run_query(
        &self,
        parent: Option<&str>,
        structured_query: Value,
        transaction: Option<&str>,
    ) -> anyhow::Result<Vec<Document>> {
        let parent_path = match parent {
            Some(parent) => format!("{}/{parent}", self.documents_root()),
            None => self.documents_root(),
        };
        let url = self.url(&format!("{parent_path}:runQuery"));
        let mut body = json!({ "structuredQuery": structured_query });
        if let Some(transaction) = transaction {
            body["transaction"] = Value::String(transaction.to_string());
        }
        let response = self
            .authorize(self.http.post(url))
            .await?
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let rows: Vec<Value> = response.json().await?;
        let mut documents = Vec::new();
        for row in rows {
            let Some(document) = row.get("document") else {
                continue;
            };
            let Some(name) = document.get("name").and_then(Value::as_str) else {
                continue;
            };
            documents.push(Document {
                path: self.strip_root(name).to_string(),
                fields: document
                    .get("fields")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            });
        }
        Ok(documents)
    }

    pub async fn delete_document(&self, path: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("{}/{path}", self.documents_root()));
        let response = self.authorize(self.http.delete(url)).await?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    /// Build an update write for `commit`. With a field mask only the named
    /// paths are replaced; without one the whole document is.
    pub fn update_write(
        &self,
        path: &str,
        fields: Value,
        field_mask: Option<Vec<String>>,
        exists_precondition: Option<bool>,
    ) -> Value {
        let mut write = json!({
            "update": {
                "name": self.resource_name(path),
                "fields": fields,
            }
        });
        if let Some(paths) = field_mask {
            write["updateMask"] = json!({ "fieldPaths": paths });
        }
        if let Some(exists) = exists_precondition {
            write["currentDocument"] = json!({ "exists": exists });
        }
        write
    }

    pub fn delete_write(&self, path: &str) -> Value {
        json!({ "delete": self.resource_name(path) })
    }
}
