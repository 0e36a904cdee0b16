// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod session;

pub use session::{
    start_session, SessionHandle, SessionHandleError, SessionService, SessionStartError, StandardSessionService,
};
