use ethereum_types::{Address, H256};
use serde::Deserialize;
use serde_json::json;
use stepex_vm::{errors::VmError, external::ExternalSource};

/// Witness source backed by an archive node exposing hash-addressed blobs
/// over a JSON API. Every response is re-verified against the requested hash
/// by the engine before use.
pub struct HttpSource {
    endpoint: String,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct BlobResponse {
    result: Option<String>,
}

impl HttpSource {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn fetch(&self, method: &str, params: Vec<String>, missing: VmError) -> Result<Vec<u8>, VmError> {
        let request = json!({ "method": method, "params": params });
        let response: BlobResponse = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|_| clone_missing(&missing))?
            .json()
            .map_err(|_| clone_missing(&missing))?;

        let Some(blob) = response.result else {
            return Err(missing);
        };
        let stripped = blob.strip_prefix("0x").unwrap_or(&blob);
        hex::decode(stripped).map_err(|_| missing)
    }
}

fn clone_missing(err: &VmError) -> VmError {
    match err {
        VmError::MissingNode(h) => VmError::MissingNode(*h),
        VmError::MissingCode(h) => VmError::MissingCode(*h),
        VmError::MissingHeader(h) => VmError::MissingHeader(*h),
        _ => VmError::Internal("unreachable missing-blob error"),
    }
}

impl ExternalSource for HttpSource {
    fn block_header(&self, block_hash: H256) -> Result<Vec<u8>, VmError> {
        self.fetch(
            "stepex_blockHeader",
            vec![format!("{block_hash:#x}")],
            VmError::MissingHeader(block_hash),
        )
    }

    fn get_world_node(&self, node_hash: H256) -> Result<Vec<u8>, VmError> {
        self.fetch(
            "stepex_worldNode",
            vec![format!("{node_hash:#x}")],
            VmError::MissingNode(node_hash),
        )
    }

    fn get_acc_storage_node(&self, address: Address, node_hash: H256) -> Result<Vec<u8>, VmError> {
        self.fetch(
            "stepex_accountStorageNode",
            vec![format!("{address:#x}"), format!("{node_hash:#x}")],
            VmError::MissingNode(node_hash),
        )
    }

    fn get_code(&self, code_hash: H256) -> Result<Vec<u8>, VmError> {
        self.fetch(
            "stepex_code",
            vec![format!("{code_hash:#x}")],
            VmError::MissingCode(code_hash),
        )
    }
}
