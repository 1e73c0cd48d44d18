//! Binary encodings for every message that crosses a channel, a mailbox
//! slot or an invite code.

pub mod messages;
pub mod state;

pub use messages::{
    AdditionalData, AuthData, Invite, InviteData, InviteReceipt, InviteRequest, InviteResponse,
    PersistedRequest, RequestPayload, ResponsePayload, ResponseStatus,
};
pub use state::{Codec, DecodeError, Decoder};
