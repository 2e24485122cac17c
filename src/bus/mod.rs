// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BusPro wire protocol: frame codec, UDP transport and the paced
//! send scheduler.

pub mod codec;
pub mod scheduler;
pub mod transport;

pub use codec::{CoverAction, OperateCode, Telegram};
pub use scheduler::{CommandKind, SendScheduler};
pub use transport::{BusSink, RxTelegram, UdpTransport};
