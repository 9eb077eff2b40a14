//! Blocking forms of the session operations.
//!
//! Each wraps its async counterpart. Do not call these from a task running on
//! a current-thread runtime: the runtime thread would be blocked while the
//! operation needs it to make progress. Use `spawn_blocking` or a plain thread.

use std::{future::Future, sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use sessionbus_core::{LockToken, ReceiveMode, ReceivedMessage, Result};
use tokio::runtime::Handle;

use crate::{acceptor::SessionAcceptor, handle::MessageSession};

/// Run a future to completion from synchronous code.
fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

    if let Ok(handle) = Handle::try_current() {
        // Inside a runtime: park a scoped thread instead of the caller's worker.
        std::thread::scope(|s| {
            let worker = s.spawn(|| {
                let _guard = handle.enter();
                futures::executor::block_on(future)
            });
            match worker.join() {
                Ok(output) => output,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    } else {
        RT.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("sessionbus-blocking")
                .enable_all()
                .build()
                .unwrap_or_else(|e| panic!("failed to build blocking runtime: {e}"))
        })
        .block_on(future)
    }
}

impl SessionAcceptor {
    /// Blocking form of [`SessionAcceptor::accept_session`].
    ///
    /// # Errors
    /// See [`SessionAcceptor::accept_session_with_timeout`].
    pub fn accept_session_blocking(
        &self,
        entity_path: &str,
        session_id: Option<&str>,
        receive_mode: ReceiveMode,
    ) -> Result<MessageSession> {
        block_on(self.accept_session(entity_path, session_id, receive_mode))
    }

    /// Blocking form of [`SessionAcceptor::accept_session_with_timeout`].
    ///
    /// # Errors
    /// See [`SessionAcceptor::accept_session_with_timeout`].
    pub fn accept_session_with_timeout_blocking(
        &self,
        entity_path: &str,
        session_id: Option<&str>,
        receive_mode: ReceiveMode,
        timeout: Duration,
    ) -> Result<MessageSession> {
        block_on(self.accept_session_with_timeout(entity_path, session_id, receive_mode, timeout))
    }
}

impl MessageSession {
    /// Blocking form of [`MessageSession::renew_session_lock`].
    ///
    /// # Errors
    /// See [`MessageSession::renew_session_lock`].
    pub fn renew_session_lock_blocking(&self) -> Result<DateTime<Utc>> {
        block_on(self.renew_session_lock())
    }

    /// Blocking form of [`MessageSession::receive_with_wait`].
    ///
    /// # Errors
    /// See [`MessageSession::receive_with_wait`].
    pub fn receive_blocking(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>> {
        block_on(self.receive_with_wait(max_wait))
    }

    /// Blocking form of [`MessageSession::complete`].
    ///
    /// # Errors
    /// See [`MessageSession::complete`].
    pub fn complete_blocking(&self, lock_token: LockToken) -> Result<()> {
        block_on(self.complete(lock_token))
    }

    /// Blocking form of [`MessageSession::get_state`].
    ///
    /// # Errors
    /// See [`MessageSession::get_state`].
    pub fn get_state_blocking(&self) -> Result<Option<Vec<u8>>> {
        block_on(self.get_state())
    }

    /// Blocking form of [`MessageSession::set_state`].
    ///
    /// # Errors
    /// See [`MessageSession::set_state`].
    pub fn set_state_blocking(&self, state: Option<&[u8]>) -> Result<()> {
        block_on(self.set_state(state))
    }

    /// Blocking form of [`MessageSession::close`].
    pub fn close_blocking(&self) {
        block_on(self.close());
    }
}
