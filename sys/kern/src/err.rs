// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel code spends a lot of its time deciding what to do about user
//! mistakes; this module separates that concern with `Result`. A syscall
//! implementation reports either a *recoverable* condition, handed back to
//! the caller as a negative return word, or a *fatal* one, which routes the
//! caller to its pager through the exit path and never returns an error
//! code at all.

use abi::{Error, ExceptionReason};

/// An error committed by user code when interacting with a syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// Indicated to the errant task by an error return.
    Recoverable(Error),
    /// Terminates the errant task; its pager hears about it as an
    /// exception message.
    Fatal(ExceptionReason),
}

impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        Self::Recoverable(e)
    }
}

impl From<ExceptionReason> for UserError {
    fn from(r: ExceptionReason) -> Self {
        Self::Fatal(r)
    }
}
