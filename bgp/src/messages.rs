// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The decoded BGP message model. The session core consumes and produces
//! these values; putting them on and taking them off the wire is the
//! codec's concern, not ours.

use num_enum::TryFromPrimitive;
use rib::{PathOrigin, Prefix, RouteFamily};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1, RFC 2918 §3
#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    KeepAlive = 4,
    RouteRefresh = 5,
}

/// A decoded BGP message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }
}

/// The autonomous system number used in the OPEN ASN field and in AS_PATH
/// attributes sent to 2-octet speakers when the real ASN does not fit.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4.
pub const BGP4: u8 = 4;

/// Ref: RFC 4271 §4.2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OpenMessage {
    pub version: u8,

    /// 2-octet ASN field; `AS_TRANS` when the real ASN needs four octets.
    pub asn: u16,

    /// Proposed hold time in seconds.
    pub hold_time: u16,

    /// BGP identifier (router-id) of the sender.
    pub id: u32,

    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// An OPEN advertising a 4-octet ASN and the given route families.
    pub fn new(
        asn: u32,
        hold_time: u16,
        id: u32,
        families: &[RouteFamily],
    ) -> Self {
        let mut caps: Vec<Capability> = families
            .iter()
            .map(|family| Capability::MultiprotocolExtensions {
                afi: family.afi,
                safi: family.safi,
            })
            .collect();
        caps.push(Capability::RouteRefresh {});
        caps.push(Capability::FourOctetAs { asn });
        Self {
            version: BGP4,
            asn: u16::try_from(asn).unwrap_or(AS_TRANS),
            hold_time,
            id,
            parameters: vec![OptionalParameter::Capabilities(caps)],
        }
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.parameters.iter().flat_map(|p| match p {
            OptionalParameter::Capabilities(caps) => caps.as_slice(),
            _ => &[],
        })
    }

    /// Route families advertised in multiprotocol capabilities.
    pub fn families(&self) -> BTreeSet<RouteFamily> {
        self.capabilities()
            .filter_map(|c| match c {
                Capability::MultiprotocolExtensions { afi, safi } => {
                    Some(RouteFamily {
                        afi: *afi,
                        safi: *safi,
                    })
                }
                _ => None,
            })
            .collect()
    }
}

/// Ref: RFC 4271 §4.2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum OptionalParameter {
    Capabilities(Vec<Capability>),
    Unassigned { code: u8 },
}

/// Capability codes from the IANA registry.
#[derive(
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 2858
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 4724
    GracefulRestart = 64,

    /// RFC 6793
    FourOctetAs = 65,
}

/// Ref: RFC 5492
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Capability {
    /// RFC 2858
    MultiprotocolExtensions { afi: u16, safi: u8 },

    /// RFC 2918
    RouteRefresh {},

    /// RFC 4724
    GracefulRestart {},

    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// RFC 8810
    Experimental { code: u8 },

    Unassigned { code: u8 },
}

impl Capability {
    pub fn code(&self) -> u8 {
        match self {
            Self::MultiprotocolExtensions { .. } => {
                CapabilityCode::MultiprotocolExtensions as u8
            }
            Self::RouteRefresh {} => CapabilityCode::RouteRefresh as u8,
            Self::GracefulRestart {} => CapabilityCode::GracefulRestart as u8,
            Self::FourOctetAs { .. } => CapabilityCode::FourOctetAs as u8,
            Self::Experimental { code } => *code,
            Self::Unassigned { code } => *code,
        }
    }
}

/// Ref: RFC 4271 §4.3
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn nexthop(&self) -> Option<IpAddr> {
        self.path_attributes.iter().find_map(|a| match a {
            PathAttribute::NextHop(addr) => Some(*addr),
            _ => None,
        })
    }

    /// The AS_PATH attribute flattened to a sequence of ASNs.
    pub fn as_path(&self) -> Vec<u32> {
        self.path_attributes
            .iter()
            .find_map(|a| match a {
                PathAttribute::AsPath(segments) => Some(flatten(segments)),
                _ => None,
            })
            .unwrap_or_default()
    }
}

fn flatten(segments: &[AsPathSegment]) -> Vec<u32> {
    segments.iter().flat_map(|s| s.value.iter().copied()).collect()
}

/// Path attribute type codes.
///
/// Ref: RFC 4271 §5, RFC 6793 §3
#[derive(
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum PathAttributeTypeCode {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    Communities = 8,
    As4Path = 17,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PathAttribute {
    Origin(PathOrigin),
    AsPath(Vec<AsPathSegment>),
    NextHop(IpAddr),
    MultiExitDisc(u32),
    LocalPref(u32),
    Communities(Vec<u32>),
    As4Path(Vec<AsPathSegment>),
}

impl PathAttribute {
    pub fn type_code(&self) -> PathAttributeTypeCode {
        match self {
            Self::Origin(_) => PathAttributeTypeCode::Origin,
            Self::AsPath(_) => PathAttributeTypeCode::AsPath,
            Self::NextHop(_) => PathAttributeTypeCode::NextHop,
            Self::MultiExitDisc(_) => PathAttributeTypeCode::MultiExitDisc,
            Self::LocalPref(_) => PathAttributeTypeCode::LocalPref,
            Self::Communities(_) => PathAttributeTypeCode::Communities,
            Self::As4Path(_) => PathAttributeTypeCode::As4Path,
        }
    }
}

#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum AsPathType {
    AsSet = 1,
    AsSequence = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AsPathSegment {
    pub typ: AsPathType,
    pub value: Vec<u32>,
}

/// Ref: RFC 4271 §4.5
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NotificationMessage {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            subcode,
            data,
        }
    }

    pub fn cease(subcode: CeaseSubcode) -> Self {
        Self::new(ErrorCode::Cease as u8, subcode as u8, Vec::new())
    }
}

/// Notification error codes.
///
/// Ref: RFC 4271 §4.5
#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

/// Ref: RFC 4271 §6.3
#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum UpdateErrorSubcode {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlags = 4,
    AttributeLength = 5,
    InvalidOriginAttribute = 6,
    InvalidNexthopAttribute = 8,
    OptionalAttribute = 9,
    InvalidNetworkField = 10,
    MalformedAsPath = 11,
}

/// Cease subcodes.
///
/// Ref: RFC 4486 §3
#[derive(
    Debug,
    Eq,
    PartialEq,
    TryFromPrimitive,
    Copy,
    Clone,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[repr(u8)]
pub enum CeaseSubcode {
    MaximumPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
}

/// Ref: RFC 2918 §3
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn family(&self) -> RouteFamily {
        RouteFamily {
            afi: self.afi,
            safi: self.safi,
        }
    }
}

/// A typed decode or validation failure. When `code` is nonzero the error
/// maps directly onto a NOTIFICATION to be sent to the peer; a zero code
/// means drop the triggering PDU without notifying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MessageError {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
    pub reason: String,
}

impl MessageError {
    pub fn new(code: u8, subcode: u8, reason: &str) -> Self {
        Self {
            code,
            subcode,
            data: Vec::new(),
            reason: reason.into(),
        }
    }

    fn update(subcode: UpdateErrorSubcode, reason: &str) -> Self {
        Self::new(ErrorCode::Update as u8, subcode as u8, reason)
    }

    pub fn to_notification(&self) -> NotificationMessage {
        NotificationMessage::new(self.code, self.subcode, self.data.clone())
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "message error code={} subcode={}: {}",
            self.code, self.subcode, self.reason
        )
    }
}

impl std::error::Error for MessageError {}

/// Post-decode validation of an UPDATE against the negotiated route
/// families.
pub fn validate_update(
    update: &UpdateMessage,
    families: &BTreeSet<RouteFamily>,
) -> Result<(), MessageError> {
    let mut seen = BTreeSet::new();
    for attr in &update.path_attributes {
        if !seen.insert(attr.type_code()) {
            return Err(MessageError::update(
                UpdateErrorSubcode::MalformedAttributeList,
                "duplicate path attribute",
            ));
        }
    }

    if !update.nlri.is_empty() {
        for required in [
            PathAttributeTypeCode::Origin,
            PathAttributeTypeCode::AsPath,
            PathAttributeTypeCode::NextHop,
        ] {
            if !seen.contains(&required) {
                let mut e = MessageError::update(
                    UpdateErrorSubcode::MissingWellKnownAttribute,
                    "missing well-known attribute",
                );
                e.data = vec![required as u8];
                return Err(e);
            }
        }
    }

    for attr in &update.path_attributes {
        match attr {
            PathAttribute::AsPath(segments)
            | PathAttribute::As4Path(segments) => {
                if segments.iter().any(|s| s.value.is_empty()) {
                    return Err(MessageError::update(
                        UpdateErrorSubcode::MalformedAsPath,
                        "empty AS path segment",
                    ));
                }
            }
            PathAttribute::NextHop(addr) => {
                if addr.is_unspecified() {
                    return Err(MessageError::update(
                        UpdateErrorSubcode::InvalidNexthopAttribute,
                        "unspecified nexthop",
                    ));
                }
            }
            _ => {}
        }
    }

    for prefix in update.nlri.iter().chain(update.withdrawn.iter()) {
        if !families.contains(&prefix.family()) {
            // Not negotiated for this session; drop without notifying.
            return Err(MessageError::new(
                0,
                0,
                &format!("route family {} not negotiated", prefix.family()),
            ));
        }
    }

    Ok(())
}

/// Fold a 4-octet AS4_PATH back into AS_PATH per RFC 6793 §4.2.3: keep the
/// leading excess of AS_PATH, then splice in AS4_PATH. An AS4_PATH longer
/// than AS_PATH is ignored.
pub fn normalize_as4_path(update: &mut UpdateMessage) {
    let as4: Option<Vec<u32>> =
        update.path_attributes.iter().find_map(|a| match a {
            PathAttribute::As4Path(segments) => Some(flatten(segments)),
            _ => None,
        });
    let Some(as4) = as4 else {
        return;
    };
    update
        .path_attributes
        .retain(|a| a.type_code() != PathAttributeTypeCode::As4Path);

    for attr in update.path_attributes.iter_mut() {
        if let PathAttribute::AsPath(segments) = attr {
            let path = flatten(segments);
            if path.len() < as4.len() {
                return;
            }
            let mut merged: Vec<u32> =
                path[..path.len() - as4.len()].to_vec();
            merged.extend_from_slice(&as4);
            *segments = vec![AsPathSegment {
                typ: AsPathType::AsSequence,
                value: merged,
            }];
            return;
        }
    }
}

/// Rewrite AS_PATH for a 2-octet speaker: ASNs that do not fit become
/// `AS_TRANS`, with the originals preserved in AS4_PATH.
///
/// Ref: RFC 6793 §4.2.2
pub fn rewrite_as_path_2byte(update: &mut UpdateMessage) {
    let mut original = None;
    for attr in update.path_attributes.iter_mut() {
        if let PathAttribute::AsPath(segments) = attr {
            if !segments
                .iter()
                .any(|s| s.value.iter().any(|asn| *asn > u16::MAX as u32))
            {
                return;
            }
            original = Some(segments.clone());
            for segment in segments.iter_mut() {
                for asn in segment.value.iter_mut() {
                    if *asn > u16::MAX as u32 {
                        *asn = AS_TRANS as u32;
                    }
                }
            }
            break;
        }
    }
    if let Some(segments) = original {
        update.path_attributes.push(PathAttribute::As4Path(segments));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn families() -> BTreeSet<RouteFamily> {
        [RouteFamily::IPV4_UNICAST].into_iter().collect()
    }

    fn well_formed(nlri: &str) -> UpdateMessage {
        UpdateMessage {
            withdrawn: Vec::new(),
            path_attributes: vec![
                PathAttribute::Origin(PathOrigin::Igp),
                PathAttribute::AsPath(vec![AsPathSegment {
                    typ: AsPathType::AsSequence,
                    value: vec![65001],
                }]),
                PathAttribute::NextHop("192.0.2.1".parse().unwrap()),
            ],
            nlri: vec![prefix(nlri)],
        }
    }

    #[test]
    fn open_family_advertisement() {
        let open = OpenMessage::new(
            4200000001,
            90,
            1,
            &[RouteFamily::IPV4_UNICAST, RouteFamily::IPV6_UNICAST],
        );
        assert_eq!(open.asn, AS_TRANS);
        let families = open.families();
        assert!(families.contains(&RouteFamily::IPV4_UNICAST));
        assert!(families.contains(&RouteFamily::IPV6_UNICAST));
        assert!(open
            .capabilities()
            .any(|c| matches!(c, Capability::FourOctetAs { asn: 4200000001 })));
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(validate_update(&well_formed("10.7.0.0/24"), &families())
            .is_ok());
    }

    #[test]
    fn validate_missing_well_known() {
        let mut update = well_formed("10.7.0.0/24");
        update
            .path_attributes
            .retain(|a| a.type_code() != PathAttributeTypeCode::NextHop);
        let e = validate_update(&update, &families()).unwrap_err();
        assert_eq!(e.code, ErrorCode::Update as u8);
        assert_eq!(
            e.subcode,
            UpdateErrorSubcode::MissingWellKnownAttribute as u8
        );
        assert_eq!(e.data, vec![PathAttributeTypeCode::NextHop as u8]);
    }

    #[test]
    fn validate_malformed_as_path() {
        let mut update = well_formed("10.7.0.0/24");
        update.path_attributes[1] = PathAttribute::AsPath(vec![AsPathSegment {
            typ: AsPathType::AsSequence,
            value: vec![],
        }]);
        let e = validate_update(&update, &families()).unwrap_err();
        assert_eq!(e.code, 3);
        assert_eq!(e.subcode, 11);
    }

    #[test]
    fn validate_unnegotiated_family() {
        let mut update = well_formed("10.7.0.0/24");
        update.nlri = vec![prefix("fd00::/64")];
        let e = validate_update(&update, &families()).unwrap_err();
        assert_eq!(e.code, 0);
    }

    #[test]
    fn as4_path_merge() {
        let mut update = well_formed("10.7.0.0/24");
        update.path_attributes[1] = PathAttribute::AsPath(vec![AsPathSegment {
            typ: AsPathType::AsSequence,
            value: vec![65001, AS_TRANS as u32],
        }]);
        update
            .path_attributes
            .push(PathAttribute::As4Path(vec![AsPathSegment {
                typ: AsPathType::AsSequence,
                value: vec![4200000001],
            }]));
        normalize_as4_path(&mut update);
        assert_eq!(update.as_path(), vec![65001, 4200000001]);
        assert!(!update
            .path_attributes
            .iter()
            .any(|a| a.type_code() == PathAttributeTypeCode::As4Path));
    }

    #[test]
    fn as4_path_longer_than_as_path_ignored() {
        let mut update = well_formed("10.7.0.0/24");
        update
            .path_attributes
            .push(PathAttribute::As4Path(vec![AsPathSegment {
                typ: AsPathType::AsSequence,
                value: vec![4200000001, 4200000002],
            }]));
        normalize_as4_path(&mut update);
        assert_eq!(update.as_path(), vec![65001]);
    }

    #[test]
    fn two_byte_rewrite() {
        let mut update = well_formed("10.7.0.0/24");
        update.path_attributes[1] = PathAttribute::AsPath(vec![AsPathSegment {
            typ: AsPathType::AsSequence,
            value: vec![4200000001, 65001],
        }]);
        rewrite_as_path_2byte(&mut update);
        assert_eq!(update.as_path(), vec![AS_TRANS as u32, 65001]);
        let as4 = update
            .path_attributes
            .iter()
            .find_map(|a| match a {
                PathAttribute::As4Path(segments) => Some(flatten(segments)),
                _ => None,
            })
            .unwrap();
        assert_eq!(as4, vec![4200000001, 65001]);
    }

    #[test]
    fn two_byte_rewrite_noop_for_small_asns() {
        let mut update = well_formed("10.7.0.0/24");
        let before = update.clone();
        rewrite_as_path_2byte(&mut update);
        assert_eq!(update, before);
    }
}
