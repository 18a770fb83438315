pub mod creds;
pub mod signal_data;

pub use creds::{AccountSettings, AuthenticationCreds, Contact};
pub use signal_data::{
    AppStateSyncKeyData, AppStateSyncKeyFingerprint, IndexValue, LtHashState, SignalDataSet,
    SignalDataType, SignalValue, TcToken,
};
