use std::sync::Arc;

use fnv::FnvHashMap;
use tracing::{debug, info, warn};

use crate::everlink::common::{Error, Result};
use crate::everlink::config::Settings;
use crate::everlink::forward::destination::ForwardDestinationHandler;
use crate::everlink::forward::source::ForwardSourceHandler;
use crate::everlink::net;
use crate::everlink::proto::port_forward_data::Body;
use crate::everlink::proto::{
    PortForwardData, PortForwardDestinationRequest, PortForwardDestinationResponse,
    PortForwardSourceRequest, PortForwardSourceResponse, SocketEndpoint,
};

/// Give up minting a fresh socket id after this many collisions.
const MINT_SOCKET_ID_ATTEMPTS: usize = 100000;

/// The multiplexer for one side of a session: all of this side's source
/// handlers plus all of its destination handlers, keyed by socket id. Not
/// internally synchronized; the caller drives update() and the handle_*
/// methods from one task, typically alternating with pumping frames over the
/// Connection.
pub struct PortForwardHandler {
    settings: Settings,
    sources: Vec<ForwardSourceHandler>,
    destinations: FnvHashMap<i32, ForwardDestinationHandler>,
}

impl PortForwardHandler {
    pub fn new(settings: Settings) -> PortForwardHandler {
        PortForwardHandler {
            settings,
            sources: Vec::new(),
            destinations: FnvHashMap::default(),
        }
    }

    pub fn sources(&self) -> &[ForwardSourceHandler] {
        &self.sources
    }

    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    /// Creates a listening source from a peer's request. Any failure is
    /// reported in the response rather than returned, because the peer is
    /// the one who needs to hear about it.
    pub async fn create_source(
        &mut self,
        request: &PortForwardSourceRequest,
    ) -> PortForwardSourceResponse {
        match self.try_create_source(request).await {
            Ok(()) => PortForwardSourceResponse { error: None },
            Err(e) => {
                warn!(%e, "failed to create forward source");
                PortForwardSourceResponse {
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_create_source(&mut self, request: &PortForwardSourceRequest) -> Result<()> {
        let source = request
            .source
            .as_ref()
            .ok_or_else(|| Error::protocol_error("source request without a source endpoint"))?;

        let (listen_endpoint, destination) = match &request.destination {
            Some(destination) => (source.clone(), destination.clone()),
            None => {
                // No destination given: listen on a fresh pipe path instead
                // and dial the request's source endpoint for each tunnel.
                // The path is published through the named environment
                // variable so local processes can find it.
                let path = std::env::temp_dir()
                    .join(format!("everlink_{:08x}", rand::random::<u32>()))
                    .to_string_lossy()
                    .into_owned();
                if let Some(variable) = &request.environment_variable {
                    std::env::set_var(variable, &path);
                }
                (SocketEndpoint::unix(&path), source.clone())
            }
        };

        let listener = net::listen_endpoint(&listen_endpoint).await?;
        // Rewritten with the actual port for ephemeral (port 0) binds.
        let bound = match (listener.local_port(), listen_endpoint.port) {
            (Some(port), Some(_)) => {
                let mut endpoint = listen_endpoint.clone();
                endpoint.port = Some(port as u32);
                endpoint
            }
            _ => listen_endpoint,
        };
        info!(source = %bound, destination = %destination, "forwarding source open");
        self.sources.push(ForwardSourceHandler::new(
            listener,
            bound,
            destination,
            &self.settings,
        ));
        Ok(())
    }

    /// Dials the requested destination and, on success, mints the socket id
    /// that both sides key this tunnel by from now on.
    pub async fn handle_destination_request(
        &mut self,
        request: &PortForwardDestinationRequest,
    ) -> PortForwardDestinationResponse {
        let destination = match &request.destination {
            Some(destination) => destination,
            None => {
                return PortForwardDestinationResponse {
                    client_fd: request.fd,
                    socket_id: None,
                    error: Some("destination request without an endpoint".to_string()),
                }
            }
        };
        match net::dial_endpoint(destination).await {
            Ok(stream) => match self.mint_socket_id() {
                Ok(socket_id) => {
                    debug!(socket_id, destination = %destination, "tunnel destination open");
                    self.destinations.insert(
                        socket_id,
                        ForwardDestinationHandler::new(Arc::new(stream), socket_id, &self.settings),
                    );
                    PortForwardDestinationResponse {
                        client_fd: request.fd,
                        socket_id: Some(socket_id),
                        error: None,
                    }
                }
                Err(e) => {
                    stream.close();
                    PortForwardDestinationResponse {
                        client_fd: request.fd,
                        socket_id: None,
                        error: Some(e.to_string()),
                    }
                }
            },
            Err(e) => {
                debug!(destination = %destination, %e, "tunnel dial failed");
                PortForwardDestinationResponse {
                    client_fd: request.fd,
                    socket_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Routes the peer's answer to one of our pending source fds.
    pub fn handle_destination_response(&mut self, response: &PortForwardDestinationResponse) {
        let source = match self
            .sources
            .iter_mut()
            .find(|s| s.has_unassigned_fd(response.client_fd))
        {
            Some(source) => source,
            None => {
                warn!(
                    client_fd = response.client_fd,
                    "destination response for an unknown fd"
                );
                return;
            }
        };
        if let Some(error) = &response.error {
            info!(client_fd = response.client_fd, %error, "peer failed to open destination");
            source.close_unassigned_fd(response.client_fd);
            return;
        }
        match response.socket_id {
            Some(socket_id) => {
                source.add_socket(socket_id, response.client_fd);
            }
            None => {
                warn!(client_fd = response.client_fd, "destination response with neither socket id nor error");
                source.close_unassigned_fd(response.client_fd);
            }
        }
    }

    /// Routes one inbound frame to the tunnel it belongs to. Frames for ids
    /// this side no longer has are dropped; a close can race data in flight.
    pub async fn handle_data(&mut self, data: &PortForwardData) {
        if data.source_to_destination {
            let handler = match self.destinations.get_mut(&data.socket_id) {
                Some(handler) => handler,
                None => {
                    debug!(socket_id = data.socket_id, "frame for an unknown destination");
                    return;
                }
            };
            match &data.body {
                Some(Body::Buffer(payload)) => {
                    if let Err(e) = handler.write(payload).await {
                        debug!(socket_id = data.socket_id, %e, "destination write failed");
                        handler.close();
                        self.destinations.remove(&data.socket_id);
                    }
                }
                Some(Body::Closed(_)) => {
                    handler.close();
                    self.destinations.remove(&data.socket_id);
                }
                Some(Body::Error(error)) => {
                    debug!(socket_id = data.socket_id, %error, "peer reported tunnel error");
                    handler.close();
                    self.destinations.remove(&data.socket_id);
                }
                None => debug!(socket_id = data.socket_id, "frame with no body"),
            }
        } else {
            let source = match self
                .sources
                .iter_mut()
                .find(|s| s.contains_socket(data.socket_id))
            {
                Some(source) => source,
                None => {
                    debug!(socket_id = data.socket_id, "frame for an unknown source");
                    return;
                }
            };
            match &data.body {
                Some(Body::Buffer(payload)) => {
                    if let Err(e) = source.send_data(data.socket_id, payload).await {
                        debug!(socket_id = data.socket_id, %e, "source write failed");
                        source.close_socket(data.socket_id);
                    }
                }
                Some(Body::Closed(_)) => source.close_socket(data.socket_id),
                Some(Body::Error(error)) => {
                    debug!(socket_id = data.socket_id, %error, "peer reported tunnel error");
                    source.close_socket(data.socket_id);
                }
                None => debug!(socket_id = data.socket_id, "frame with no body"),
            }
        }
    }

    /// One polling tick: pick up newly accepted local connections (returning
    /// the destination requests to send to the peer) and drain every handler
    /// into outbound frames.
    pub fn update(
        &mut self,
        output: &mut Vec<PortForwardData>,
    ) -> Vec<PortForwardDestinationRequest> {
        let mut requests = Vec::new();
        for source in self.sources.iter_mut() {
            requests.extend(source.accept_new_connections());
            source.update(output);
        }
        for handler in self.destinations.values_mut() {
            handler.update(output);
        }
        self.destinations.retain(|_, handler| !handler.is_closed());
        requests
    }

    fn mint_socket_id(&self) -> Result<i32> {
        mint_unique_id(|candidate| self.destinations.contains_key(&candidate))
    }
}

/// Random non-negative id not matching `exists`, with a bounded number of
/// retries on collision.
fn mint_unique_id(exists: impl Fn(i32) -> bool) -> Result<i32> {
    for _ in 0..MINT_SOCKET_ID_ATTEMPTS {
        let candidate = (rand::random::<u32>() >> 1) as i32;
        if !exists(candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::new("ran out of socket ids"))
}
