// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Log with the neighbor address attached as a structured key. `$self` is
/// any object with a `neighbor` field carrying a `host` socket address.
macro_rules! neighbor_log {
    ($self:expr, $level:ident, $($args:tt)+) => {
        slog::$level!($self.log, $($args)+;
            "neighbor" => %$self.neighbor.host,
        )
    };
}

pub(crate) use neighbor_log;
