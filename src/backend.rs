use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::DispatchError;
use crate::http::{HttpRequest, RetryClient, Transport};

/// Galaxy user API key. Never printed.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Reference to a workflow input: a dataset (`hda`) or a collection (`hdca`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub src: String,
    pub id: String,
}

impl InputRef {
    pub fn dataset(id: impl Into<String>) -> Self {
        Self {
            src: "hda".to_string(),
            id: id.into(),
        }
    }

    pub fn collection(id: impl Into<String>) -> Self {
        Self {
            src: "hdca".to_string(),
            id: id.into(),
        }
    }
}

pub type WorkflowInputs = BTreeMap<String, InputRef>;

/// Operations the dispatcher needs from the execution backend.
pub trait Backend: Send + Sync {
    fn find_workflow(&self, name: &str) -> Result<String, DispatchError>;
    /// Input step id for `label`; the lowest-numbered input when `label` is `None`.
    fn workflow_input(&self, workflow_id: &str, label: Option<&str>) -> Result<String, DispatchError>;
    /// Id of the history called `name`, created when missing.
    fn ensure_history(&self, name: &str) -> Result<String, DispatchError>;
    /// Imports `url` by reference into `history_id` and returns the dataset id.
    /// A known MD5 lets the backend verify the transfer.
    fn upload_dataset(
        &self,
        history_id: &str,
        url: &str,
        name: &str,
        md5: Option<&str>,
    ) -> Result<String, DispatchError>;
    fn create_paired_collection(
        &self,
        history_id: &str,
        forward_id: &str,
        reverse_id: &str,
        name: &str,
    ) -> Result<String, DispatchError>;
    /// Returns the invocation id.
    fn invoke_workflow(
        &self,
        workflow_id: &str,
        history_id: &str,
        inputs: &WorkflowInputs,
    ) -> Result<String, DispatchError>;
    fn invocation_state(&self, invocation_id: &str) -> Result<String, DispatchError>;
}

#[derive(Debug, Deserialize)]
struct NamedItem {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowDetail {
    #[serde(default)]
    inputs: BTreeMap<String, WorkflowInputMeta>,
}

#[derive(Debug, Deserialize)]
struct WorkflowInputMeta {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

pub struct GalaxyBackend<T: Transport> {
    client: RetryClient<T>,
    base_url: String,
}

impl<T: Transport> GalaxyBackend<T> {
    /// `client` must already carry the API key header.
    pub fn new(client: RetryClient<T>, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn id_from(&self, payload: &Value, what: &str) -> Result<String, DispatchError> {
        payload["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.unexpected(format!("{what} response has no id: {payload}")))
    }

    fn unexpected(&self, message: String) -> DispatchError {
        DispatchError::UnexpectedPayload {
            service: self.client.service(),
            message,
        }
    }
}

impl<T: Transport> Backend for GalaxyBackend<T> {
    fn find_workflow(&self, name: &str) -> Result<String, DispatchError> {
        let workflows: Vec<NamedItem> = self
            .client
            .call_json(&HttpRequest::get(self.url("/api/workflows")))?;
        let mut matches = workflows
            .into_iter()
            .filter(|wf| wf.name.as_deref() == Some(name));
        match (matches.next(), matches.next()) {
            (Some(wf), None) => Ok(wf.id),
            (Some(_), Some(_)) => Err(DispatchError::AmbiguousWorkflow(name.to_string())),
            (None, _) => Err(DispatchError::WorkflowNotFound(name.to_string())),
        }
    }

    fn workflow_input(&self, workflow_id: &str, label: Option<&str>) -> Result<String, DispatchError> {
        let detail: WorkflowDetail = self
            .client
            .call_json(&HttpRequest::get(self.url(&format!("/api/workflows/{workflow_id}"))))?;
        if detail.inputs.is_empty() {
            return Err(self.unexpected(format!("workflow {workflow_id} has no declared inputs")));
        }
        match label {
            Some(label) => detail
                .inputs
                .iter()
                .find(|(_, meta)| {
                    meta.label.as_deref() == Some(label) || meta.name.as_deref() == Some(label)
                })
                .map(|(id, _)| id.clone())
                .ok_or_else(|| DispatchError::WorkflowInputNotFound {
                    workflow: workflow_id.to_string(),
                    label: label.to_string(),
                }),
            None => Ok(lowest_input_id(detail.inputs.keys())),
        }
    }

    fn ensure_history(&self, name: &str) -> Result<String, DispatchError> {
        let request = HttpRequest::get(self.url("/api/histories"))
            .query("q", "name")
            .query("qv", name);
        let existing: Vec<NamedItem> = self.client.call_json(&request)?;
        if let Some(history) = existing
            .into_iter()
            .find(|item| item.name.as_deref() == Some(name))
        {
            return Ok(history.id);
        }
        let created: Value = self.client.call_json(&HttpRequest::post(
            self.url("/api/histories"),
            json!({ "name": name }),
        ))?;
        self.id_from(&created, "history")
    }

    fn upload_dataset(
        &self,
        history_id: &str,
        url: &str,
        name: &str,
        md5: Option<&str>,
    ) -> Result<String, DispatchError> {
        let mut element = json!({"src": "url", "url": url, "name": name});
        if let Some(md5) = md5 {
            element["hashes"] = json!([{"hash_function": "MD5", "hash_value": md5}]);
        }
        let payload = json!({
            "history_id": history_id,
            "targets": [{
                "destination": {"type": "hdas"},
                "elements": [element],
            }],
        });
        let response: Value = self
            .client
            .call_json(&HttpRequest::post(self.url("/api/tools/fetch"), payload))?;
        response["outputs"]
            .as_array()
            .and_then(|outputs| outputs.first())
            .and_then(|output| output["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| self.unexpected(format!("no outputs returned when fetching {url}")))
    }

    fn create_paired_collection(
        &self,
        history_id: &str,
        forward_id: &str,
        reverse_id: &str,
        name: &str,
    ) -> Result<String, DispatchError> {
        let payload = json!({
            "history_id": history_id,
            "collection_type": "paired",
            "name": name,
            "element_identifiers": [
                {"name": "forward", "src": "hda", "id": forward_id},
                {"name": "reverse", "src": "hda", "id": reverse_id},
            ],
        });
        let response: Value = self
            .client
            .call_json(&HttpRequest::post(self.url("/api/dataset_collections"), payload))?;
        self.id_from(&response, "collection")
    }

    fn invoke_workflow(
        &self,
        workflow_id: &str,
        history_id: &str,
        inputs: &WorkflowInputs,
    ) -> Result<String, DispatchError> {
        let payload = json!({ "history_id": history_id, "inputs": inputs });
        let response: Value = self.client.call_json(&HttpRequest::post(
            self.url(&format!("/api/workflows/{workflow_id}/invocations")),
            payload,
        ))?;
        // Batch submissions answer with a list of invocations.
        let invocation = match &response {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        self.id_from(&invocation, "invocation")
    }

    fn invocation_state(&self, invocation_id: &str) -> Result<String, DispatchError> {
        let response: Value = self.client.call_json(&HttpRequest::get(
            self.url(&format!("/api/invocations/{invocation_id}")),
        ))?;
        response["state"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.unexpected(format!("invocation {invocation_id} has no state")))
    }
}

fn lowest_input_id<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let mut keys = keys.cloned().collect::<Vec<_>>();
    keys.sort_by_key(|key| (key.parse::<u64>().unwrap_or(u64::MAX), key.clone()));
    keys.into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_redacted() {
        let key = ApiKey::new(" secret ").unwrap();
        assert_eq!(key.expose(), "secret");
        assert_eq!(format!("{key:?}"), "ApiKey(<redacted>)");
        assert_eq!(key.to_string(), "<redacted>");
        assert!(ApiKey::new("  ").is_none());
    }

    #[test]
    fn numeric_inputs_sort_numerically() {
        let keys = vec!["10".to_string(), "2".to_string(), "label".to_string()];
        assert_eq!(lowest_input_id(keys.iter()), "2");
    }

    #[test]
    fn input_refs_serialize_like_galaxy_expects() {
        let mut inputs = WorkflowInputs::new();
        inputs.insert("0".to_string(), InputRef::collection("c1"));
        inputs.insert("1".to_string(), InputRef::dataset("d1"));
        let value = serde_json::to_value(&inputs).unwrap();
        assert_eq!(value["0"], json!({"src": "hdca", "id": "c1"}));
        assert_eq!(value["1"], json!({"src": "hda", "id": "d1"}));
    }
}
