//! Bounded worker pool dispatching requests to the sender.

use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender as ChannelSender};

use super::subscriber::Subscriber;
use super::{ConnectorError, Metadata, ResponseHandler, Sender};
use crate::protocol::Message;

/// One unit of work: deliver a message for a subscriber.
pub struct Request {
    pub subscriber: Arc<Subscriber>,
    pub message: Arc<Message>,
}

struct Handlers {
    sender: Arc<dyn Sender>,
    response_handler: Option<Arc<dyn ResponseHandler>>,
}

/// Fixed pool of worker threads pulling from a shared bounded channel.
///
/// Each worker invokes the sender, measures the call latency, and hands
/// the outcome to the response handler. The sender and handler can be
/// swapped only while no request is in flight; the write lock holds all
/// workers at the pull point.
pub struct Queue {
    input: Mutex<Option<ChannelSender<Request>>>,
    handlers: Arc<RwLock<Handlers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    pub fn new(sender: Arc<dyn Sender>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let (input_tx, input_rx) = bounded(capacity.max(1));
        let handlers = Arc::new(RwLock::new(Handlers {
            sender,
            response_handler: None,
        }));

        let mut joins = Vec::with_capacity(workers);
        for worker in 0..workers {
            let rx = input_rx.clone();
            let handlers = Arc::clone(&handlers);
            let join = std::thread::Builder::new()
                .name(format!("queue-worker-{worker}"))
                .spawn(move || run_worker(rx, handlers))
                .expect("spawn queue worker");
            joins.push(join);
        }

        Self {
            input: Mutex::new(Some(input_tx)),
            handlers,
            workers: Mutex::new(joins),
        }
    }

    /// Submit a request; blocks when all workers are busy and the channel
    /// is full. Fails once the queue is stopped.
    pub fn push(&self, request: Request) -> Result<(), ConnectorError> {
        // Clone the sender out of the lock: the send may block on a full
        // channel and must not hold up `stop`.
        let tx = {
            let input = self.input.lock().expect("queue input lock poisoned");
            match input.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(ConnectorError::QueueStopped),
            }
        };
        tx.send(request).map_err(|_| ConnectorError::QueueStopped)
    }

    pub fn set_sender(&self, sender: Arc<dyn Sender>) {
        self.handlers
            .write()
            .expect("queue handlers lock poisoned")
            .sender = sender;
    }

    pub fn set_response_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.handlers
            .write()
            .expect("queue handlers lock poisoned")
            .response_handler = Some(handler);
    }

    /// Close the input channel and wait for the workers to drain.
    pub fn stop(&self) {
        self.input
            .lock()
            .expect("queue input lock poisoned")
            .take();
        let workers = std::mem::take(
            &mut *self.workers.lock().expect("queue workers lock poisoned"),
        );
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: Receiver<Request>, handlers: Arc<RwLock<Handlers>>) {
    for request in rx {
        let handlers = handlers.read().expect("queue handlers lock poisoned");
        let started = Instant::now();
        let result = handlers.sender.send(&request);
        let metadata = Metadata {
            latency: started.elapsed(),
        };
        match &handlers.response_handler {
            Some(handler) => handler.handle_response(request, result, metadata),
            None => {
                if let Err(err) = result {
                    tracing::error!(%err, "sender failed and no response handler is set");
                }
            }
        }
    }
}
