//! Per-link worker task
//!
//! Opens the link's connection and runs its operations strictly in order,
//! so description and candidate application for one peer never overlap.

use crate::actions::LinkOp;
use crate::backend::{LinkEvent, LinkEventSink, LinkSpec, RtcBackend, RtcConnection};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub(crate) async fn run_link(
    backend: Arc<dyn RtcBackend>,
    spec: LinkSpec,
    sink: LinkEventSink,
    mut ops: mpsc::UnboundedReceiver<LinkOp>,
) {
    let peer_id = spec.peer_id.clone();
    let generation = spec.generation;

    let mut connection = match backend.open(spec, sink.clone()).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(peer_id = %peer_id, generation, error = %e, "Failed to open connection");
            sink.emit(LinkEvent::OpenFailed(e.to_string()));
            return;
        }
    };
    debug!(peer_id = %peer_id, generation, "Link worker started");

    while let Some(op) = ops.recv().await {
        let name = op.name();
        trace!(peer_id = %peer_id, generation, op = name, "Running link op");
        if let Err(e) = execute(connection.as_mut(), op, &sink).await {
            debug!(peer_id = %peer_id, generation, op = name, error = %e, "Link op failed");
            sink.emit(LinkEvent::OperationFailed {
                operation: name,
                error: e.to_string(),
            });
        }
    }

    if let Err(e) = connection.close().await {
        debug!(peer_id = %peer_id, generation, error = %e, "Error closing connection");
    }
    debug!(peer_id = %peer_id, generation, "Link worker stopped");
}

async fn execute(
    connection: &mut dyn RtcConnection,
    op: LinkOp,
    sink: &LinkEventSink,
) -> crate::Result<()> {
    match op {
        LinkOp::CreateOffer { ice_restart } => {
            let offer = connection.create_offer(ice_restart).await?;
            sink.emit(LinkEvent::OfferCreated(offer));
        }
        LinkOp::AcceptOffer(offer) => {
            let answer = connection.accept_offer(offer).await?;
            sink.emit(LinkEvent::AnswerCreated(answer));
        }
        LinkOp::AcceptAnswer(answer) => {
            connection.accept_answer(answer).await?;
            sink.emit(LinkEvent::AnswerApplied);
        }
        LinkOp::AddCandidate(candidate) => connection.add_candidate(candidate).await?,
        LinkOp::SendData(data) => connection.send_data(data).await?,
        LinkOp::SetOutgoingEnabled(enabled) => connection.set_outgoing_enabled(enabled).await?,
    }
    Ok(())
}
