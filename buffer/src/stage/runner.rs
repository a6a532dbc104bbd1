//! Stage tasks - the input and output loops of a buffer stage

use super::TaskGuard;
use crate::buffer::Buffer;
use crate::error::VarastoError;
use crate::metrics::Metrics;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use varasto_core::{Message, Response};

/// Resolve once shutdown is requested
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also counts as shutdown
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Input task: inbound channel → buffer, one response upstream per message
///
/// `relay` is only set for deferring buffers; it carries the downstream
/// response for the message just pushed.
pub(crate) async fn input_loop(
    guard: TaskGuard,
    mut inbound: mpsc::Receiver<Message>,
    upstream: mpsc::Sender<Response>,
    mut relay: Option<mpsc::Receiver<Response>>,
) {
    let shared = guard.shared();
    let buffer = &shared.buffer;
    let mut shutdown = shared.subscribe_shutdown();

    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    info!(
                        backlog = buffer.backlog(),
                        "Inbound channel closed, draining buffer"
                    );
                    shared.begin_close();
                    buffer.close_once_empty();
                    break;
                }
            },
        };

        let pushed = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            res = buffer.push_message(msg) => res,
        };

        let response = match pushed {
            Ok(_) => match relay.as_mut() {
                Some(relay) => {
                    let relayed = tokio::select! {
                        biased;
                        _ = shutdown_signalled(&mut shutdown) => break,
                        res = relay.recv() => res,
                    };
                    match relayed {
                        Some(response) => response,
                        None => break,
                    }
                }
                None => Response::Ack,
            },
            Err(VarastoError::Closed) => break,
            Err(e) if e.is_fatal() => {
                shared.fail(&e);
                break;
            }
            Err(e) => {
                warn!(error = %e, "Rejected inbound message");
                if let Some(m) = Metrics::get() {
                    m.record_rejected(e.reason());
                }
                Response::failure(e)
            }
        };

        let sent = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            res = upstream.send(response) => res,
        };
        if sent.is_err() {
            debug!("Upstream response receiver dropped");
        }
    }

    debug!("Input task finished");
}

/// Output task: buffer → downstream, shifting only on success
pub(crate) async fn output_loop(
    guard: TaskGuard,
    outbound: mpsc::Sender<Message>,
    mut responses: mpsc::Receiver<Response>,
    relay: Option<mpsc::Sender<Response>>,
) {
    let shared = guard.shared();
    let buffer = shared.buffer.as_ref();
    let defers = relay.is_some();
    let mut shutdown = shared.subscribe_shutdown();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_signalled(&mut shutdown) => break,
            res = buffer.next_message() => res,
        };
        let msg = match next {
            Ok(msg) => msg,
            Err(VarastoError::Closed) => break,
            Err(e) => {
                shared.fail(&e);
                break;
            }
        };

        let step = AssertUnwindSafe(deliver(
            buffer,
            msg,
            defers,
            &outbound,
            &mut responses,
            &mut shutdown,
        ))
        .catch_unwind()
        .await;

        let response = match step {
            Ok(Delivery::Done(response)) => response,
            Ok(Delivery::Stopped) => break,
            Ok(Delivery::Failed(e)) => {
                shared.fail(&e);
                break;
            }
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Delivery step panicked, treating as nack"
                );
                if let Some(m) = Metrics::get() {
                    m.record_nacked();
                }
                if defers {
                    // The slot may already be empty if the panic came after the shift
                    let _ = buffer.shift_message();
                }
                Response::failure("delivery panicked")
            }
        };

        if let Some(relay) = &relay {
            let sent = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => break,
                res = relay.send(response) => res,
            };
            if sent.is_err() {
                break;
            }
        }
    }

    debug!("Output task finished");
}

/// Outcome of one delivery step
enum Delivery {
    /// Downstream answered; storing buffers shifted on success
    Done(Response),
    /// Shutdown or a closed channel interrupted the step
    Stopped,
    /// Shifting hit a storage failure
    Failed(VarastoError),
}

/// Send one message downstream, wait for its response and shift on success
async fn deliver(
    buffer: &dyn Buffer,
    msg: Message,
    defers: bool,
    outbound: &mpsc::Sender<Message>,
    responses: &mut mpsc::Receiver<Response>,
    shutdown: &mut watch::Receiver<bool>,
) -> Delivery {
    let sent = tokio::select! {
        biased;
        _ = shutdown_signalled(shutdown) => return Delivery::Stopped,
        res = outbound.send(msg) => res,
    };
    if sent.is_err() {
        warn!("Downstream message receiver dropped, stopping output");
        return Delivery::Stopped;
    }

    let response = tokio::select! {
        biased;
        _ = shutdown_signalled(shutdown) => return Delivery::Stopped,
        res = responses.recv() => res,
    };
    let Some(response) = response else {
        warn!("Downstream response channel closed, stopping output");
        return Delivery::Stopped;
    };

    if let Some(reason) = response.error() {
        warn!(
            error = reason,
            backlog = buffer.backlog(),
            "Downstream delivery failed"
        );
        if let Some(m) = Metrics::get() {
            m.record_nacked();
        }
        if !defers {
            return Delivery::Done(response);
        }
    }

    match buffer.shift_message() {
        Ok(_) => Delivery::Done(response),
        Err(VarastoError::Closed) => Delivery::Stopped,
        Err(e) if e.is_fatal() => Delivery::Failed(e),
        Err(e) => {
            warn!(error = %e, "Shift after delivery failed");
            Delivery::Done(response)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(boxed.as_ref()), "owned boom");

        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
