//! Background evaluation and rendezvous channels.
//!
//! `spawn` evaluates an expression on its own OS thread against the same
//! environment chain as the caller and returns nil at once. Results flow
//! back only through channels. A channel has no buffer: `send` blocks until
//! a receiver takes the value and `recv` blocks until a sender offers one.
//! Neither operation has a timeout.
//!
//! Spawned evaluations share mutable scopes with their parent. Each single
//! binding read or write is atomic, but nothing orders a `define` in one
//! evaluation against reads in another; programs must synchronise through
//! channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::ast::{Expr, NativeHandle};
use crate::environment::Env;
use crate::evaluator::{Arity, ValueIter, enter_eval_stack, eval_with_depth_tracking};
use crate::{EVAL_STACK_SIZE, Error};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unbuffered channel carrying one `Expr` per hand-off.
///
/// Both ends live in the same value, so a channel never disconnects while a
/// program can still reach it.
#[derive(Debug, Clone)]
pub struct Channel {
    tx: Sender<Expr>,
    rx: Receiver<Expr>,
}

impl Channel {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Channel { tx, rx }
    }

    /// Block until a receiver takes `value`.
    pub fn send(&self, value: Expr) -> Result<(), Error> {
        self.tx
            .send(value)
            .map_err(|_| Error::EvalError("channel is disconnected".to_owned()))
    }

    /// Block until a sender offers a value.
    pub fn recv(&self) -> Result<Expr, Error> {
        self.rx
            .recv()
            .map_err(|_| Error::EvalError("channel is disconnected".to_owned()))
    }

    /// Bounded wait for embedders and tests; programs only get the
    /// unbounded operations.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Expr, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Default for Channel {
    fn default() -> Self {
        Channel::new()
    }
}

/// Evaluate spawn special form: start evaluating the operand in the
/// background and return nil without waiting.
pub(crate) fn eval_spawn(args: &[Expr], env: &Env, _depth: usize) -> Result<Expr, Error> {
    let [expr] = args else {
        return Err(Error::arity_error(Arity::Exact(1), args.len()));
    };

    let task = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
    let expr = expr.clone();
    let env = env.clone();

    std::thread::Builder::new()
        .name(format!("kakapo-task-{task}"))
        .stack_size(EVAL_STACK_SIZE)
        .spawn(move || {
            enter_eval_stack(EVAL_STACK_SIZE);
            tracing::trace!(task, %expr, "spawned evaluation started");
            match eval_with_depth_tracking(&expr, &env, 0) {
                Ok(_) => tracing::trace!(task, "spawned evaluation finished"),
                // Nobody is waiting for the result, so the log is all that remains
                Err(error) => tracing::warn!(task, %error, %expr, "spawned evaluation failed"),
            }
        })
        .map_err(|e| Error::EvalError(format!("failed to spawn evaluation: {e}")))?;

    tracing::debug!(task, "spawned evaluation");
    Ok(Expr::Nil)
}

pub(crate) fn make_chan() -> NativeHandle {
    NativeHandle::new(Channel::new())
}

pub(crate) fn send(channel: &Channel, value: Expr) -> Result<(), Error> {
    channel.send(value)
}

pub(crate) fn recv(channel: &Channel) -> Result<Expr, Error> {
    channel.recv()
}

/// `(<- ch)` receives, `(<- ch value)` sends.
pub(crate) fn arrow(channel: &Channel, mut rest: ValueIter<'_>) -> Result<Expr, Error> {
    match (rest.next(), rest.next()) {
        (None, _) => channel.recv(),
        (Some(value), None) => channel.send(value.clone()).map(|()| Expr::Nil),
        (Some(_), Some(_)) => Err(Error::arity_error(Arity::Range(1, 2), 2 + 1 + rest.len())),
    }
}
