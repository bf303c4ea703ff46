//! Binary wire codec for socket frames.
//!
//! Every frame is a `u8` event id followed by a fixed big-endian layout.
//! Decoding fails closed: unknown ids, truncated payloads, trailing bytes,
//! out-of-range flags/enums, invalid UTF-8 and impossible coordinates are all
//! [ProtocolError]s.
//!
//! | id | event | layout |
//! |---|---|---|
//! | 1 | Offer | u64 ride |
//! | 2 | OfferResponse | u64 ride, bool accepted |
//! | 3 | OfferSent | u64 ride, bool p2p |
//! | 4 | Position | f64 lat, f64 lng, u16 heading, u16 kmh, u8 n + n×u64 ignore, opt u64 ride |
//! | 5 | DriverSetup | f64 lat, f64 lng, u8 n + n×u8 pay, u8 n + n×u8 type, u8 n + n×(u8 len + utf-8) district, u64 vehicle |
//! | 6 | State | u8 state, opt u64 ride |
//! | 7 | CancelRide | u64 ride |
//! | 8 | StartRide | u64 ride, f64 lat, f64 lng |
//! | 9 | FinishRide | u64 ride, f64 lat, f64 lng |
//! | 10 | VoyagerRideAcceptedResponse | u64 ride, u64 driver pid, u64 timestamp |
//! | 11 | DriverRideAcceptedResponse | u64 ride, u64 timestamp |
//! | 12 | NoDriverFound | u64 ride, u16 iterations |
//! | 13 | RideCanceled | u64 ride, u8 outcome, u8 role |
//!
//! `bool` is a `u8` 0/1; `opt u64` is a `u8` flag 0/1 followed by the value when set.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::ecs::{CancellationOutcome, GeoPoint, ParticipantPid, PayMethod, RidePid, RideType, Role};
use crate::error::ProtocolError;

const OFFER: u8 = 1;
const OFFER_RESPONSE: u8 = 2;
const OFFER_SENT: u8 = 3;
const POSITION: u8 = 4;
const DRIVER_SETUP: u8 = 5;
const STATE: u8 = 6;
const CANCEL_RIDE: u8 = 7;
const START_RIDE: u8 = 8;
const FINISH_RIDE: u8 = 9;
const VOYAGER_RIDE_ACCEPTED: u8 = 10;
const DRIVER_RIDE_ACCEPTED: u8 = 11;
const NO_DRIVER_FOUND: u8 = 12;
const RIDE_CANCELED: u8 = 13;

/// Driver-reported state carried by the `State` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireDriverState {
    Available,
    PickingUp,
    Running,
}

impl WireDriverState {
    pub fn code(self) -> u8 {
        match self {
            WireDriverState::Available => 0,
            WireDriverState::PickingUp => 1,
            WireDriverState::Running => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WireDriverState::Available),
            1 => Some(WireDriverState::PickingUp),
            2 => Some(WireDriverState::Running),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub point: GeoPoint,
    pub heading: u16,
    pub kmh: u16,
    /// Rides the driver never wants to be offered again. Replaces the previous list.
    pub ignore: Vec<RidePid>,
    /// Ride the participant is currently in, if any.
    pub ride: Option<RidePid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSetup {
    pub point: GeoPoint,
    pub pay_methods: Vec<PayMethod>,
    pub ride_types: Vec<RideType>,
    pub drop_districts: Vec<String>,
    pub vehicle_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireEvent {
    Offer {
        ride: RidePid,
    },
    OfferResponse {
        ride: RidePid,
        accepted: bool,
    },
    OfferSent {
        ride: RidePid,
        p2p: bool,
    },
    Position(PositionUpdate),
    DriverSetup(DriverSetup),
    State {
        state: WireDriverState,
        ride: Option<RidePid>,
    },
    CancelRide {
        ride: RidePid,
    },
    StartRide {
        ride: RidePid,
        at: GeoPoint,
    },
    FinishRide {
        ride: RidePid,
        at: GeoPoint,
    },
    VoyagerRideAccepted {
        ride: RidePid,
        driver: ParticipantPid,
        timestamp: u64,
    },
    DriverRideAccepted {
        ride: RidePid,
        timestamp: u64,
    },
    NoDriverFound {
        ride: RidePid,
        iterations: u16,
    },
    RideCanceled {
        ride: RidePid,
        outcome: CancellationOutcome,
        by: Role,
    },
}

fn event_name(id: u8) -> &'static str {
    match id {
        OFFER => "offer",
        OFFER_RESPONSE => "offerResponse",
        OFFER_SENT => "offerSent",
        POSITION => "position",
        DRIVER_SETUP => "driverSetup",
        STATE => "state",
        CANCEL_RIDE => "cancelRide",
        START_RIDE => "startRide",
        FINISH_RIDE => "finishRide",
        VOYAGER_RIDE_ACCEPTED => "voyagerRideAcceptedResponse",
        DRIVER_RIDE_ACCEPTED => "driverRideAcceptedResponse",
        NO_DRIVER_FOUND => "noDriverFound",
        RIDE_CANCELED => "rideCanceled",
        _ => "unknown",
    }
}

impl WireEvent {
    pub fn event_id(&self) -> u8 {
        match self {
            WireEvent::Offer { .. } => OFFER,
            WireEvent::OfferResponse { .. } => OFFER_RESPONSE,
            WireEvent::OfferSent { .. } => OFFER_SENT,
            WireEvent::Position(_) => POSITION,
            WireEvent::DriverSetup(_) => DRIVER_SETUP,
            WireEvent::State { .. } => STATE,
            WireEvent::CancelRide { .. } => CANCEL_RIDE,
            WireEvent::StartRide { .. } => START_RIDE,
            WireEvent::FinishRide { .. } => FINISH_RIDE,
            WireEvent::VoyagerRideAccepted { .. } => VOYAGER_RIDE_ACCEPTED,
            WireEvent::DriverRideAccepted { .. } => DRIVER_RIDE_ACCEPTED,
            WireEvent::NoDriverFound { .. } => NO_DRIVER_FOUND,
            WireEvent::RideCanceled { .. } => RIDE_CANCELED,
        }
    }

    pub fn name(&self) -> &'static str {
        event_name(self.event_id())
    }

    /// Whether a client connected with `role` may send this event.
    /// Server-to-client notifications are never accepted inbound.
    pub fn accepted_from(&self, role: Role) -> bool {
        match self {
            WireEvent::Position(_) | WireEvent::CancelRide { .. } => true,
            WireEvent::OfferResponse { .. }
            | WireEvent::DriverSetup(_)
            | WireEvent::State { .. }
            | WireEvent::StartRide { .. }
            | WireEvent::FinishRide { .. } => role == Role::Driver,
            WireEvent::Offer { .. }
            | WireEvent::OfferSent { .. }
            | WireEvent::VoyagerRideAccepted { .. }
            | WireEvent::DriverRideAccepted { .. }
            | WireEvent::NoDriverFound { .. }
            | WireEvent::RideCanceled { .. } => false,
        }
    }

    /// Ride the event refers to, when it names one.
    pub fn ride(&self) -> Option<RidePid> {
        match self {
            WireEvent::Offer { ride }
            | WireEvent::OfferResponse { ride, .. }
            | WireEvent::OfferSent { ride, .. }
            | WireEvent::CancelRide { ride }
            | WireEvent::StartRide { ride, .. }
            | WireEvent::FinishRide { ride, .. }
            | WireEvent::VoyagerRideAccepted { ride, .. }
            | WireEvent::DriverRideAccepted { ride, .. }
            | WireEvent::NoDriverFound { ride, .. }
            | WireEvent::RideCanceled { ride, .. } => Some(*ride),
            WireEvent::Position(update) => update.ride,
            WireEvent::State { ride, .. } => *ride,
            WireEvent::DriverSetup(_) => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.event_id());
        let event = self.name();
        match self {
            WireEvent::Offer { ride } | WireEvent::CancelRide { ride } => buf.put_u64(ride.0),
            WireEvent::OfferResponse { ride, accepted } => {
                buf.put_u64(ride.0);
                buf.put_u8(u8::from(*accepted));
            }
            WireEvent::OfferSent { ride, p2p } => {
                buf.put_u64(ride.0);
                buf.put_u8(u8::from(*p2p));
            }
            WireEvent::Position(update) => {
                put_point(&mut buf, update.point);
                buf.put_u16(update.heading);
                buf.put_u16(update.kmh);
                buf.put_u8(list_len(update.ignore.len(), event, "ignore")?);
                for ride in &update.ignore {
                    buf.put_u64(ride.0);
                }
                put_opt_u64(&mut buf, update.ride.map(|r| r.0));
            }
            WireEvent::DriverSetup(setup) => {
                put_point(&mut buf, setup.point);
                buf.put_u8(list_len(setup.pay_methods.len(), event, "payMethods")?);
                for method in &setup.pay_methods {
                    buf.put_u8(method.code());
                }
                buf.put_u8(list_len(setup.ride_types.len(), event, "rideTypes")?);
                for ride_type in &setup.ride_types {
                    buf.put_u8(ride_type.code());
                }
                buf.put_u8(list_len(setup.drop_districts.len(), event, "dropDistricts")?);
                for district in &setup.drop_districts {
                    buf.put_u8(list_len(district.len(), event, "dropDistrict")?);
                    buf.put_slice(district.as_bytes());
                }
                buf.put_u64(setup.vehicle_id);
            }
            WireEvent::State { state, ride } => {
                buf.put_u8(state.code());
                put_opt_u64(&mut buf, ride.map(|r| r.0));
            }
            WireEvent::StartRide { ride, at } | WireEvent::FinishRide { ride, at } => {
                buf.put_u64(ride.0);
                put_point(&mut buf, *at);
            }
            WireEvent::VoyagerRideAccepted {
                ride,
                driver,
                timestamp,
            } => {
                buf.put_u64(ride.0);
                buf.put_u64(driver.0);
                buf.put_u64(*timestamp);
            }
            WireEvent::DriverRideAccepted { ride, timestamp } => {
                buf.put_u64(ride.0);
                buf.put_u64(*timestamp);
            }
            WireEvent::NoDriverFound { ride, iterations } => {
                buf.put_u64(ride.0);
                buf.put_u16(*iterations);
            }
            WireEvent::RideCanceled { ride, outcome, by } => {
                buf.put_u64(ride.0);
                buf.put_u8(outcome.code());
                buf.put_u8(by.code());
            }
        }
        Ok(buf.to_vec())
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&id, payload) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let event = event_name(id);
        let mut r = Reader {
            buf: payload,
            event,
        };
        let decoded = match id {
            OFFER => WireEvent::Offer { ride: r.ride()? },
            OFFER_RESPONSE => WireEvent::OfferResponse {
                ride: r.ride()?,
                accepted: r.bool("accepted")?,
            },
            OFFER_SENT => WireEvent::OfferSent {
                ride: r.ride()?,
                p2p: r.bool("p2p")?,
            },
            POSITION => {
                let point = r.point()?;
                let heading = r.u16()?;
                let kmh = r.u16()?;
                let n = r.u8()?;
                let mut ignore = Vec::with_capacity(usize::from(n));
                for _ in 0..n {
                    ignore.push(r.ride()?);
                }
                let ride = r.opt_u64("pid")?.map(RidePid);
                WireEvent::Position(PositionUpdate {
                    point,
                    heading,
                    kmh,
                    ignore,
                    ride,
                })
            }
            DRIVER_SETUP => {
                let point = r.point()?;
                let n = r.u8()?;
                let mut pay_methods = Vec::with_capacity(usize::from(n));
                for _ in 0..n {
                    let code = r.u8()?;
                    pay_methods.push(PayMethod::from_code(code).ok_or(
                        ProtocolError::InvalidValue {
                            event,
                            field: "payMethod",
                            value: u64::from(code),
                        },
                    )?);
                }
                let n = r.u8()?;
                let mut ride_types = Vec::with_capacity(usize::from(n));
                for _ in 0..n {
                    let code = r.u8()?;
                    ride_types.push(RideType::from_code(code).ok_or(
                        ProtocolError::InvalidValue {
                            event,
                            field: "rideType",
                            value: u64::from(code),
                        },
                    )?);
                }
                let n = r.u8()?;
                let mut drop_districts = Vec::with_capacity(usize::from(n));
                for _ in 0..n {
                    drop_districts.push(r.string()?);
                }
                let vehicle_id = r.u64()?;
                WireEvent::DriverSetup(DriverSetup {
                    point,
                    pay_methods,
                    ride_types,
                    drop_districts,
                    vehicle_id,
                })
            }
            STATE => {
                let code = r.u8()?;
                let state = WireDriverState::from_code(code).ok_or(ProtocolError::InvalidValue {
                    event,
                    field: "state",
                    value: u64::from(code),
                })?;
                let ride = r.opt_u64("pid")?.map(RidePid);
                if state != WireDriverState::Available && ride.is_none() {
                    return Err(ProtocolError::InvalidValue {
                        event,
                        field: "pid",
                        value: 0,
                    });
                }
                WireEvent::State { state, ride }
            }
            CANCEL_RIDE => WireEvent::CancelRide { ride: r.ride()? },
            START_RIDE => WireEvent::StartRide {
                ride: r.ride()?,
                at: r.point()?,
            },
            FINISH_RIDE => WireEvent::FinishRide {
                ride: r.ride()?,
                at: r.point()?,
            },
            VOYAGER_RIDE_ACCEPTED => WireEvent::VoyagerRideAccepted {
                ride: r.ride()?,
                driver: ParticipantPid(r.u64()?),
                timestamp: r.u64()?,
            },
            DRIVER_RIDE_ACCEPTED => WireEvent::DriverRideAccepted {
                ride: r.ride()?,
                timestamp: r.u64()?,
            },
            NO_DRIVER_FOUND => WireEvent::NoDriverFound {
                ride: r.ride()?,
                iterations: r.u16()?,
            },
            RIDE_CANCELED => {
                let ride = r.ride()?;
                let code = r.u8()?;
                let outcome =
                    CancellationOutcome::from_code(code).ok_or(ProtocolError::InvalidValue {
                        event,
                        field: "outcome",
                        value: u64::from(code),
                    })?;
                let code = r.u8()?;
                let by = Role::from_code(code).ok_or(ProtocolError::InvalidValue {
                    event,
                    field: "role",
                    value: u64::from(code),
                })?;
                WireEvent::RideCanceled { ride, outcome, by }
            }
            other => return Err(ProtocolError::UnknownEvent(other)),
        };
        r.finish()?;
        Ok(decoded)
    }
}

fn list_len(len: usize, event: &'static str, field: &'static str) -> Result<u8, ProtocolError> {
    u8::try_from(len).map_err(|_| ProtocolError::ListTooLong { event, field })
}

fn put_point(buf: &mut BytesMut, point: GeoPoint) {
    buf.put_f64(point.lat);
    buf.put_f64(point.lng);
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    event: &'static str,
}

impl Reader<'_> {
    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated { event: self.event })
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn ride(&mut self) -> Result<RidePid, ProtocolError> {
        self.u64().map(RidePid)
    }

    fn bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                event: self.event,
                field,
                value: u64::from(other),
            }),
        }
    }

    fn opt_u64(&mut self, field: &'static str) -> Result<Option<u64>, ProtocolError> {
        if self.bool(field)? {
            self.u64().map(Some)
        } else {
            Ok(None)
        }
    }

    fn point(&mut self) -> Result<GeoPoint, ProtocolError> {
        self.need(16)?;
        let point = GeoPoint::new(self.buf.get_f64(), self.buf.get_f64());
        if point.is_valid() {
            Ok(point)
        } else {
            Err(ProtocolError::InvalidCoordinate { event: self.event })
        }
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = usize::from(self.u8()?);
        self.need(len)?;
        let (raw, rest) = self.buf.split_at(len);
        self.buf = rest;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { event: self.event })
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes {
                event: self.event,
                extra,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_layout_is_id_then_big_endian_pid() {
        let bytes = WireEvent::Offer { ride: RidePid(0x0102) }
            .encode()
            .expect("encode");
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn decodes_offer_response_from_raw_bytes() {
        let frame = [2, 0, 0, 0, 0, 0, 0, 0, 42, 1];
        assert_eq!(
            WireEvent::decode(&frame).expect("decode"),
            WireEvent::OfferResponse {
                ride: RidePid(42),
                accepted: true
            }
        );
    }

    #[test]
    fn position_layout_matches_table() {
        let event = WireEvent::Position(PositionUpdate {
            point: GeoPoint::new(1.5, -2.0),
            heading: 90,
            kmh: 40,
            ignore: vec![RidePid(3)],
            ride: Some(RidePid(9)),
        });
        let bytes = event.encode().expect("encode");
        // id + 16 coords + 2 + 2 + (1 + 8) + (1 + 8)
        assert_eq!(bytes.len(), 1 + 16 + 4 + 9 + 9);
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[17..21], &[0, 90, 0, 40]);
        assert_eq!(bytes[21], 1);
        assert_eq!(bytes[30], 1);
        assert_eq!(WireEvent::decode(&bytes).expect("decode"), event);
    }

    #[test]
    fn driver_setup_carries_districts() {
        let event = WireEvent::DriverSetup(DriverSetup {
            point: GeoPoint::new(-23.55, -46.63),
            pay_methods: vec![PayMethod::Cash, PayMethod::Card],
            ride_types: vec![RideType::Comfort],
            drop_districts: vec!["sé".into(), "pinheiros".into()],
            vehicle_id: 77,
        });
        let bytes = event.encode().expect("encode");
        assert_eq!(WireEvent::decode(&bytes).expect("decode"), event);
    }

    #[test]
    fn ride_canceled_encodes_outcome_and_role_codes() {
        let bytes = WireEvent::RideCanceled {
            ride: RidePid(5),
            outcome: CancellationOutcome::PendencyIssued,
            by: Role::Driver,
        }
        .encode()
        .expect("encode");
        assert_eq!(bytes, vec![13, 0, 0, 0, 0, 0, 0, 0, 5, 1, 1]);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(WireEvent::decode(&[]), Err(ProtocolError::EmptyFrame));
        assert_eq!(WireEvent::decode(&[99]), Err(ProtocolError::UnknownEvent(99)));
        assert_eq!(
            WireEvent::decode(&[1, 0, 0, 0]),
            Err(ProtocolError::Truncated { event: "offer" })
        );
        assert_eq!(
            WireEvent::decode(&[7, 0, 0, 0, 0, 0, 0, 0, 1, 0xff]),
            Err(ProtocolError::TrailingBytes {
                event: "cancelRide",
                extra: 1
            })
        );
        assert!(matches!(
            WireEvent::decode(&[2, 0, 0, 0, 0, 0, 0, 0, 1, 2]),
            Err(ProtocolError::InvalidValue {
                field: "accepted",
                ..
            })
        ));
        assert!(matches!(
            WireEvent::decode(&[6, 3, 0]),
            Err(ProtocolError::InvalidValue { field: "state", .. })
        ));
        // Opt flag other than 0/1.
        assert!(matches!(
            WireEvent::decode(&[6, 0, 2]),
            Err(ProtocolError::InvalidValue { field: "pid", .. })
        ));
    }

    #[test]
    fn picking_up_state_requires_pid() {
        assert!(WireEvent::decode(&[6, 1, 0]).is_err());
        assert_eq!(
            WireEvent::decode(&[6, 0, 0]).expect("available without pid"),
            WireEvent::State {
                state: WireDriverState::Available,
                ride: None
            }
        );
    }

    #[test]
    fn rejects_bad_utf8_and_coordinates() {
        let mut frame = vec![5];
        frame.extend_from_slice(&0.0f64.to_be_bytes());
        frame.extend_from_slice(&0.0f64.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 1, 2, 0xc3, 0x28]);
        frame.extend_from_slice(&1u64.to_be_bytes());
        assert_eq!(
            WireEvent::decode(&frame),
            Err(ProtocolError::InvalidUtf8 {
                event: "driverSetup"
            })
        );

        let mut frame = vec![8];
        frame.extend_from_slice(&1u64.to_be_bytes());
        frame.extend_from_slice(&95.0f64.to_be_bytes());
        frame.extend_from_slice(&0.0f64.to_be_bytes());
        assert_eq!(
            WireEvent::decode(&frame),
            Err(ProtocolError::InvalidCoordinate { event: "startRide" })
        );
    }

    #[test]
    fn role_restrictions() {
        let cancel = WireEvent::CancelRide { ride: RidePid(1) };
        let decision = WireEvent::OfferResponse {
            ride: RidePid(1),
            accepted: true,
        };
        let notification = WireEvent::Offer { ride: RidePid(1) };
        assert!(cancel.accepted_from(Role::Rider));
        assert!(cancel.accepted_from(Role::Driver));
        assert!(!decision.accepted_from(Role::Rider));
        assert!(decision.accepted_from(Role::Driver));
        assert!(!notification.accepted_from(Role::Driver));
    }

    #[test]
    fn list_longer_than_255_is_rejected_on_encode() {
        let event = WireEvent::Position(PositionUpdate {
            point: GeoPoint::new(0.0, 0.0),
            heading: 0,
            kmh: 0,
            ignore: (0..256).map(RidePid).collect(),
            ride: None,
        });
        assert_eq!(
            event.encode(),
            Err(ProtocolError::ListTooLong {
                event: "position",
                field: "ignore"
            })
        );
    }
}
