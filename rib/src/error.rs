// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid prefix {0}")]
    InvalidPrefix(String),

    #[error("invalid route family {0}")]
    InvalidRouteFamily(String),

    #[error("unknown route family {0}")]
    UnknownRouteFamily(crate::types::RouteFamily),
}
