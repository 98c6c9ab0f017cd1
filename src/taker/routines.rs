//! Various operational routines/functions.
//!
//! It defines the [`MakerTransport`] capability and the bounded request helpers the coordinator
//! and the offer syncer use to talk to makers. Every helper checks the shape of the maker's answer
//! and classifies failures: connectivity problems become [`TakerError::MakerTimeout`], answers
//! that break the protocol become [`TakerError::MakerProtocol`].

use std::{
    sync::{mpsc, Arc},
    thread::Builder,
    time::Duration,
};

use crate::{
    error::NetError,
    protocol::{
        error::ProtocolError, FundingNotice, FundingRequest, HopAccept, HopResponse, HopTerms,
        Offer, Settlement, SettlementAck,
    },
};

use super::{error::TakerError, offers::MakerAddress};

/// Request/response exchanges with makers.
///
/// Wire encoding and connection handling (clearnet or Tor) are up to the implementation. Calls
/// may block; the taker bounds each of them with its own timeout.
pub trait MakerTransport: Send + Sync {
    /// Fetches the maker's current offer.
    fn send_offer_request(&self, address: &MakerAddress) -> Result<Offer, NetError>;

    /// Proposes the terms of the maker's incoming and outgoing hops.
    fn propose_hop(&self, address: &MakerAddress, terms: &HopTerms)
        -> Result<HopResponse, NetError>;

    /// Asks the maker to fund its outgoing hop.
    fn request_funding(
        &self,
        address: &MakerAddress,
        request: &FundingRequest,
    ) -> Result<FundingNotice, NetError>;

    /// Reveals the preimage to the maker, which releases the hop it funded.
    fn exchange_settlement(
        &self,
        address: &MakerAddress,
        settlement: &Settlement,
    ) -> Result<SettlementAck, NetError>;
}

/// Runs `call` on its own thread and waits at most `timeout` for it.
///
/// A call that outlives the timeout is left to finish in the background and its result is dropped.
pub(crate) fn call_with_timeout<T, F>(
    transport: &Arc<dyn MakerTransport>,
    timeout: Duration,
    call: F,
) -> Result<T, NetError>
where
    T: Send + 'static,
    F: FnOnce(&dyn MakerTransport) -> Result<T, NetError> + Send + 'static,
{
    let transport = Arc::clone(transport);
    let (tx, rx) = mpsc::sync_channel(1);
    Builder::new()
        .name("maker-call".to_string())
        .spawn(move || {
            let _ = tx.send(call(transport.as_ref()));
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(NetError::ConnectionTimedOut),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(NetError::ReachedEOF),
    }
}

/// Classifies a transport failure.
pub(crate) fn maker_error(maker: &MakerAddress, hop: usize, e: NetError) -> TakerError {
    if e.is_transient() {
        log::warn!("Maker {maker} unreachable at hop {hop}: {e:?}");
        TakerError::MakerTimeout {
            maker: maker.clone(),
            hop,
        }
    } else {
        log::warn!("Maker {maker} sent an invalid answer at hop {hop}: {e:?}");
        TakerError::MakerProtocol {
            maker: maker.clone(),
            hop,
            reason: e.to_string(),
        }
    }
}

fn protocol_violation(maker: &MakerAddress, hop: usize, e: ProtocolError) -> TakerError {
    TakerError::MakerProtocol {
        maker: maker.clone(),
        hop,
        reason: e.to_string(),
    }
}

/// Proposes hop terms to one maker and checks its acceptance.
pub(crate) fn propose_hop_once(
    transport: &Arc<dyn MakerTransport>,
    timeout: Duration,
    maker: &MakerAddress,
    terms: HopTerms,
) -> Result<HopAccept, TakerError> {
    let hop = terms.position;
    let expected_swap_id = terms.swap_id.clone();
    let expected_outgoing = terms.outgoing.amount;
    let address = maker.clone();

    log::info!("Proposing hop terms to {maker} (position {hop})");
    let response = call_with_timeout(transport, timeout, move |t| {
        t.propose_hop(&address, &terms)
    })
    .map_err(|e| maker_error(maker, hop, e))?;

    match response {
        HopResponse::Reject { reason } => {
            log::info!("Maker {maker} rejected the hop: {reason}");
            Err(TakerError::MakerRejected {
                maker: maker.clone(),
                reason,
            })
        }
        HopResponse::Accept(accept) => {
            if accept.swap_id != expected_swap_id {
                return Err(protocol_violation(
                    maker,
                    hop,
                    ProtocolError::SwapIdMismatch {
                        expected: expected_swap_id,
                        received: accept.swap_id,
                    },
                ));
            }
            if accept.outgoing_amount != expected_outgoing {
                return Err(protocol_violation(
                    maker,
                    hop,
                    ProtocolError::IncorrectOutgoingAmount {
                        expected: expected_outgoing,
                        found: accept.outgoing_amount,
                    },
                ));
            }
            Ok(accept)
        }
    }
}

/// Asks one maker to fund its outgoing hop.
pub(crate) fn request_funding_once(
    transport: &Arc<dyn MakerTransport>,
    timeout: Duration,
    maker: &MakerAddress,
    request: FundingRequest,
) -> Result<FundingNotice, TakerError> {
    let hop = request.hop_index;
    let address = maker.clone();
    log::info!("Requesting funding of hop {hop} from {maker}");
    call_with_timeout(transport, timeout, move |t| {
        t.request_funding(&address, &request)
    })
    .map_err(|e| maker_error(maker, hop, e))
}

/// Sends the preimage to one maker and checks its acknowledgement.
pub(crate) fn send_settlement_once(
    transport: &Arc<dyn MakerTransport>,
    timeout: Duration,
    maker: &MakerAddress,
    settlement: Settlement,
) -> Result<(), TakerError> {
    let hop = settlement.hop_index;
    let expected_swap_id = settlement.swap_id.clone();
    let address = maker.clone();

    log::info!("Settling hop {hop} with {maker}");
    let ack = call_with_timeout(transport, timeout, move |t| {
        t.exchange_settlement(&address, &settlement)
    })
    .map_err(|e| maker_error(maker, hop, e))?;

    if ack.swap_id != expected_swap_id {
        return Err(protocol_violation(
            maker,
            hop,
            ProtocolError::SwapIdMismatch {
                expected: expected_swap_id,
                received: ack.swap_id,
            },
        ));
    }
    if ack.hop_index != hop {
        return Err(protocol_violation(
            maker,
            hop,
            ProtocolError::WrongSettlementHop {
                expected: hop,
                received: ack.hop_index,
            },
        ));
    }
    Ok(())
}
