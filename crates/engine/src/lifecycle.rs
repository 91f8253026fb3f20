use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use common::{
    CandleFeed, EngineCommand, EngineEvent, ExecutionClient, OrderRequest, OrderResult, Position,
    Result,
};

use crate::decision::DecisionEngine;

/// Cloneable handle for driving a running engine from the outside.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    /// Subscribe to the decision event broadcast.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }
}

/// Live trading loop: pulls candles from the feed, runs the decision core,
/// and routes its entry/exit requests to the execution client.
///
/// The loop halts for good on a fatal decision error; market or execution
/// hiccups are absorbed with warnings.
pub struct Engine {
    decision: DecisionEngine,
    feed: Box<dyn CandleFeed>,
    execution: Arc<dyn ExecutionClient>,
    /// Bounded retry count after an order rejection. 0 = no retry.
    max_order_retries: u32,
    command_rx: mpsc::Receiver<EngineCommand>,
    #[allow(dead_code)] // kept to prevent channel close
    command_tx: mpsc::Sender<EngineCommand>,
    event_tx: broadcast::Sender<EngineEvent>,
    running: bool,
}

impl Engine {
    pub fn new(
        decision: DecisionEngine,
        feed: Box<dyn CandleFeed>,
        execution: Arc<dyn ExecutionClient>,
        max_order_retries: u32,
    ) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(1024);

        let handle = EngineHandle {
            command_tx: command_tx.clone(),
            event_tx: event_tx.clone(),
        };

        let engine = Engine {
            decision,
            feed,
            execution,
            max_order_retries,
            command_rx,
            command_tx,
            event_tx,
            running: false,
        };

        (engine, handle)
    }

    /// Run the engine. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!("Engine initialized. Waiting for Start command.");

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(EngineCommand::Start) => {
                            if self.running {
                                info!("Engine already running");
                            } else {
                                info!("Engine started");
                                self.running = true;
                            }
                        }
                        Some(EngineCommand::Stop) => {
                            info!("Engine stopped, candle processing suspended");
                            self.running = false;
                        }
                        Some(EngineCommand::Flatten) => {
                            match self.decision.flatten() {
                                Ok(events) => {
                                    if self.dispatch(events).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    error!(error = %e, "Flatten failed, halting");
                                    break;
                                }
                            }
                        }
                        None => {
                            warn!("Engine command channel closed, shutting down");
                            break;
                        }
                    }
                }

                candle = self.feed.next_candle(), if self.running => {
                    match candle {
                        Ok(Some(candle)) => {
                            match self.decision.on_candle(&candle) {
                                Ok(events) => {
                                    if self.dispatch(events).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) if e.is_fatal() => {
                                    error!(error = %e, "Decision engine halted");
                                    break;
                                }
                                Err(e) => warn!(error = %e, "Candle processing error"),
                            }
                        }
                        Ok(None) => {
                            info!("Candle feed exhausted, flattening and shutting down");
                            if let Ok(events) = self.decision.flatten() {
                                let _ = self.dispatch(events).await;
                            }
                            break;
                        }
                        Err(e) => warn!(error = %e, "Candle feed error"),
                    }
                }
            }
        }
    }

    /// Broadcast a batch of decision events and act on the ones that need
    /// an order. Order results feed back into the decision core and their
    /// follow-up events join the same queue.
    async fn dispatch(&mut self, events: Vec<EngineEvent>) -> Result<()> {
        let mut queue: VecDeque<EngineEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            let _ = self.event_tx.send(event.clone());
            match &event {
                EngineEvent::EntryRequested { signal, .. } => {
                    let order = OrderRequest::market(
                        self.decision.pair(),
                        signal.direction,
                        self.decision.order_size(),
                    );
                    let result = self.place_with_retries(&order).await;
                    let follow = self.decision.on_order_result(&result).map_err(|e| {
                        error!(error = %e, "Entry result rejected by decision core");
                        e
                    })?;
                    queue.extend(follow);
                }
                EngineEvent::ExitRequested { price, .. } => {
                    let Some(position) = self.decision.position().cloned() else {
                        continue;
                    };
                    let result = self.close_with_retries(&position, *price).await;
                    let follow = self.decision.on_order_result(&result).map_err(|e| {
                        error!(error = %e, "Exit result rejected by decision core");
                        e
                    })?;
                    queue.extend(follow);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn place_with_retries(&self, order: &OrderRequest) -> OrderResult {
        let mut attempt = 0u32;
        loop {
            let outcome = self.execution.place_order(order).await;
            match outcome {
                Ok(OrderResult::Rejected { reason }) if attempt < self.max_order_retries => {
                    attempt += 1;
                    warn!(reason = %reason, attempt, "Entry order rejected, retrying");
                }
                Ok(result) => return result,
                Err(e) if attempt < self.max_order_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Entry order failed, retrying");
                }
                Err(e) => {
                    return OrderResult::Rejected {
                        reason: e.to_string(),
                    }
                }
            }
        }
    }

    async fn close_with_retries(&self, position: &Position, price_hint: f64) -> OrderResult {
        let mut attempt = 0u32;
        loop {
            let outcome = self.execution.close_position(position, price_hint).await;
            match outcome {
                Ok(OrderResult::Rejected { reason }) if attempt < self.max_order_retries => {
                    attempt += 1;
                    warn!(reason = %reason, attempt, "Close order rejected, retrying");
                }
                Ok(result) => return result,
                Err(e) if attempt < self.max_order_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "Close order failed, retrying");
                }
                Err(e) => {
                    error!(error = %e, "Close order failed after retries, position stays tracked");
                    return OrderResult::Rejected {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }
}
