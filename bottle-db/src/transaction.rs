//! # Transaction Module
//!
//! Depth-counted transactions on a [`Connection`].
//!
//! ## Features
//!
//! - **Nesting**: only the outermost `trans_begin` sends BEGIN, only the
//!   outermost commit or rollback ends the native transaction
//! - **Rollback marking**: a rollback at any level rolls back the whole
//!   transaction; the outermost commit then sends ROLLBACK
//! - **Managed Transactions**: `trans_start`/`trans_complete` commit when every
//!   query succeeded and roll back otherwise
//! - **Test Mode**: `trans_start(true)` always ends in a rollback
//!
//! A failed query inside a transaction marks it failed but never rolls it
//! back by itself. The caller decides.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! conn.trans_start(false).await?;
//! conn.query("INSERT INTO orders (id) VALUES (?)", vec![1]).await?;
//! conn.query("UPDATE stock SET qty = qty - 1 WHERE id = ?", vec![9]).await?;
//!
//! if !conn.trans_complete().await? {
//!     log::warn!("order rolled back");
//! }
//! ```

use crate::{Error, connection::Connection};

// ============================================================================
// Transaction State
// ============================================================================

/// Per-connection transaction bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct TransactionState {
    /// 0 = no transaction.
    pub depth: u32,
    /// False once a query failed inside a transaction.
    pub status: bool,
    /// Set by test mode; forces `trans_complete` to roll back.
    pub failure: bool,
    /// Set by a nested rollback; the outermost commit rolls back instead.
    pub rollback_only: bool,
    pub enabled: bool,
    pub strict: bool,
}

impl Default for TransactionState {
    fn default() -> Self {
        Self { depth: 0, status: true, failure: false, rollback_only: false, enabled: true, strict: true }
    }
}

// ============================================================================
// Connection Implementation
// ============================================================================

impl Connection {
    /// Current nesting depth.
    pub fn trans_depth(&self) -> u32 {
        self.trans.depth
    }

    /// False when a query failed inside the current (or, in strict mode, a
    /// previous) managed transaction.
    pub fn trans_status(&self) -> bool {
        self.trans.status
    }

    /// Clears a failed status left over by strict mode.
    pub fn reset_trans_status(&mut self) -> &mut Self {
        self.trans.status = true;
        self
    }

    /// Disables transactions. Every `trans_*` call becomes a no-op returning false.
    pub fn trans_off(&mut self) -> &mut Self {
        self.trans.enabled = false;
        self
    }

    /// In strict mode (default) a failed managed transaction keeps the status
    /// failed, so later groups roll back too.
    pub fn trans_strict(&mut self, strict: bool) -> &mut Self {
        self.trans.strict = strict;
        self
    }

    /// Begins a transaction, or deepens the current one.
    ///
    /// # Arguments
    ///
    /// * `test_mode` - When true, `trans_complete` rolls back even if every
    ///   query succeeded.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The transaction began (or nesting increased)
    /// * `Ok(false)` - Transactions are disabled, or BEGIN failed outside debug mode
    pub async fn trans_begin(&mut self, test_mode: bool) -> Result<bool, Error> {
        if !self.trans.enabled {
            return Ok(false);
        }

        if self.trans.depth > 0 {
            self.trans.depth += 1;
            return Ok(true);
        }

        self.ensure_connected().await?;
        self.trans.failure = test_mode;
        self.trans.rollback_only = false;

        let begin = self.dialect().begin_statement();
        if self.native(begin).await? {
            self.trans.depth += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commits the outermost transaction, or just leaves a nested level.
    ///
    /// If a nested level rolled back, the outermost commit sends ROLLBACK and
    /// returns `Ok(false)`.
    pub async fn trans_commit(&mut self) -> Result<bool, Error> {
        if !self.trans.enabled || self.trans.depth == 0 {
            return Ok(false);
        }

        if self.trans.depth > 1 {
            self.trans.depth -= 1;
            return Ok(true);
        }

        if self.trans.rollback_only {
            let rollback = self.dialect().rollback_statement();
            if self.native(rollback).await? {
                self.end_transaction();
            }
            return Ok(false);
        }

        let commit = self.dialect().commit_statement();
        if self.native(commit).await? {
            self.end_transaction();
            return Ok(true);
        }
        Ok(false)
    }

    /// Rolls back the outermost transaction. At a nested level only marks the
    /// transaction so the outermost commit rolls back.
    pub async fn trans_rollback(&mut self) -> Result<bool, Error> {
        if !self.trans.enabled || self.trans.depth == 0 {
            return Ok(false);
        }

        if self.trans.depth > 1 {
            self.trans.depth -= 1;
            self.trans.rollback_only = true;
            return Ok(true);
        }

        let rollback = self.dialect().rollback_statement();
        if self.native(rollback).await? {
            self.end_transaction();
            return Ok(true);
        }
        Ok(false)
    }

    /// Starts a managed transaction.
    pub async fn trans_start(&mut self, test_mode: bool) -> Result<bool, Error> {
        if !self.trans.enabled {
            return Ok(false);
        }
        self.trans_begin(test_mode).await
    }

    /// Completes a managed transaction: commits when every query succeeded,
    /// rolls back otherwise.
    ///
    /// Returns `Ok(false)` when the transaction was rolled back.
    pub async fn trans_complete(&mut self) -> Result<bool, Error> {
        if !self.trans.enabled {
            return Ok(false);
        }

        if !self.trans.status || self.trans.failure {
            self.trans_rollback().await?;

            if !self.trans.strict {
                self.trans.status = true;
            }

            log::debug!("Transaction rolled back on {}", self.driver());
            return Ok(false);
        }

        self.trans_commit().await
    }

    fn end_transaction(&mut self) {
        self.trans.depth = 0;
        self.trans.rollback_only = false;
    }

    /// Sends a transaction control statement.
    async fn native(&mut self, sql: &str) -> Result<bool, Error> {
        match self.execute_internal(sql).await {
            Ok(_) => Ok(true),
            Err(err) if self.is_debug() => Err(err),
            Err(err) => {
                log::error!("[{}] {} failed: {}", self.driver(), sql, err);
                Ok(false)
            }
        }
    }
}
