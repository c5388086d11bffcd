//! Request dispatch against the registry

use pim_proto::{DirectoryRequest, DirectoryResponse, ServiceInfo};
use pim_registry::{LookupError, Registry, ServiceRecord};
use tracing::{debug, error};

/// Answer one request line
pub fn handle_request(registry: &Registry, line: &str) -> DirectoryResponse {
    let request = match DirectoryRequest::parse(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected request {:?}: {}", line, e);
            return DirectoryResponse::bad_request(&e);
        }
    };

    match request {
        DirectoryRequest::Ping => DirectoryResponse::Pong,
        DirectoryRequest::AddService { address, port } => {
            match registry.add(ServiceRecord::new(address, port)) {
                Ok(token) => DirectoryResponse::ServiceAdded(token),
                Err(e) => {
                    error!("Failed to register service: {}", e);
                    DirectoryResponse::internal_error("Unable to allocate token")
                }
            }
        }
        DirectoryRequest::GetInfo { token } => match registry.lookup(&token) {
            Ok(found) => DirectoryResponse::Info(ServiceInfo {
                port: found.record.port,
                time_remaining: found.remaining_secs(),
                service_name: found.record.address,
            }),
            Err(LookupError::NotFound) => DirectoryResponse::not_found(),
            Err(LookupError::Expired) => DirectoryResponse::expired(),
        },
    }
}
