//! Gateway protocol headers exchanged with application code.

use http::HeaderName;

/// Response: park the request under these comma-separated correlation keys
pub const PARK: HeaderName = HeaderName::from_static("x-gilgate-park");

/// Response: `<seconds> <action>` for a parked request that is never notified
pub const PARK_TIMEOUT: HeaderName = HeaderName::from_static("x-gilgate-park-timeout");

/// Request: set on a resumed parked request, carrying the notification payload
pub const PARK_ARG: HeaderName = HeaderName::from_static("x-gilgate-park-arg");

/// Response: wait for an internal retry under this id.
/// Request: set on the resubmitted request with the same id.
pub const RETRY: HeaderName = HeaderName::from_static("x-gilgate-retry");

/// Response: block the client address for this many seconds
pub const BLOCK: HeaderName = HeaderName::from_static("x-gilgate-block");

/// Headers that steer the gateway and never reach the client
pub const CONTROL: [HeaderName; 4] = [PARK, PARK_TIMEOUT, RETRY, BLOCK];
