//! Wire protocol definitions.
//!
//! Every new TCP connection opens with a single ASCII digit plus newline
//! that types the connection; control connections then carry framed RPC
//! calls selected by the numeric codes below. The code table is the stable
//! wire contract; renumbering it breaks every deployed client.

/// Connection-kind digits, sent as the first byte of every connection.
pub mod conn {
    /// Control connection: loads a driver, then carries RPC calls.
    pub const DRIVER_LOAD: u8 = b'0';
    /// Reserved for a log-stream channel; not implemented.
    pub const LOG_STREAM: u8 = b'1';
    /// Data connection, samples flowing server to client.
    pub const DATA_OUT: u8 = b'2';
    /// Data connection, samples flowing client to server.
    pub const DATA_IN: u8 = b'3';
}

/// Reply for an RPC call code the server does not recognize. The
/// connection is torn down afterwards.
pub const UNKNOWN_CALL: i32 = -1000;

/// RPC operation codes.
///
/// Request framing: one integer line (the code) followed by the call's
/// argument lines in documented order. Setters reply `0`; error replies
/// are distinct negative integers. `Drop` has no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCall {
    // identification API
    GetHardwareKey = 10,
    GetHardwareInfo = 11,
    // channel API
    GetFrontendMapping = 12,
    SetFrontendMapping = 13,
    GetNumChannels = 14,
    GetChannelInfo = 15,
    GetFullDuplex = 16,
    // stream API
    GetStreamFormats = 20,
    GetNativeStreamFormat = 21,
    SetupStream = 22,
    ActivateStream = 23,
    DeactivateStream = 24,
    CloseStream = 25,
    GetStreamMtu = 26,
    GetStreamArgsInfo = 27,
    // antenna API
    ListAntennas = 30,
    GetAntenna = 31,
    SetAntenna = 32,
    // gain API
    ListGains = 40,
    HasGainMode = 41,
    GetGainRange = 42,
    GetGainRangeNamed = 43,
    GetGainMode = 44,
    SetGainMode = 45,
    GetGain = 46,
    SetGain = 47,
    GetGainNamed = 48,
    SetGainNamed = 49,
    // sample rate API
    GetSampleRate = 50,
    GetSampleRateRange = 51,
    SetSampleRate = 52,
    // frequency API
    GetFrequency = 60,
    SetFrequency = 61,
    GetFrequencyNamed = 62,
    SetFrequencyNamed = 63,
    ListFrequencies = 64,
    GetFrequencyRange = 65,
    GetFrequencyRangeNamed = 66,
    // special: release the connection and its device, no reply
    Drop = 1000,
}

impl RpcCall {
    /// Decode a wire call code.
    pub fn from_code(code: i32) -> Option<Self> {
        use RpcCall::*;
        Some(match code {
            10 => GetHardwareKey,
            11 => GetHardwareInfo,
            12 => GetFrontendMapping,
            13 => SetFrontendMapping,
            14 => GetNumChannels,
            15 => GetChannelInfo,
            16 => GetFullDuplex,
            20 => GetStreamFormats,
            21 => GetNativeStreamFormat,
            22 => SetupStream,
            23 => ActivateStream,
            24 => DeactivateStream,
            25 => CloseStream,
            26 => GetStreamMtu,
            27 => GetStreamArgsInfo,
            30 => ListAntennas,
            31 => GetAntenna,
            32 => SetAntenna,
            40 => ListGains,
            41 => HasGainMode,
            42 => GetGainRange,
            43 => GetGainRangeNamed,
            44 => GetGainMode,
            45 => SetGainMode,
            46 => GetGain,
            47 => SetGain,
            48 => GetGainNamed,
            49 => SetGainNamed,
            50 => GetSampleRate,
            51 => GetSampleRateRange,
            52 => SetSampleRate,
            60 => GetFrequency,
            61 => SetFrequency,
            62 => GetFrequencyNamed,
            63 => SetFrequencyNamed,
            64 => ListFrequencies,
            65 => GetFrequencyRange,
            66 => GetFrequencyRangeNamed,
            1000 => Drop,
            _ => return None,
        })
    }

    /// The wire code for this call.
    pub fn code(self) -> i32 {
        self as i32
    }
}
