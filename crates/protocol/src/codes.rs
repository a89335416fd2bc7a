use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status codes handed back to RPC callers. The string values are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    GenericError,
    SignatureFailure,
    WrongFileSize,
    Timeout,
    FileRequestFailure,
    WrongInput,
    WrongSpAddress,
    InternalDataFailure,
    InternalCommFailure,
    WrongFileInfo,
    WrongWalletAddress,
    UploadData,
    DownloadOk,
    DownloadOkAskInfo,
    SharedDownloadStart,
}

impl ResultCode {
    pub const ALL: [ResultCode; 16] = [
        ResultCode::Success,
        ResultCode::GenericError,
        ResultCode::SignatureFailure,
        ResultCode::WrongFileSize,
        ResultCode::Timeout,
        ResultCode::FileRequestFailure,
        ResultCode::WrongInput,
        ResultCode::WrongSpAddress,
        ResultCode::InternalDataFailure,
        ResultCode::InternalCommFailure,
        ResultCode::WrongFileInfo,
        ResultCode::WrongWalletAddress,
        ResultCode::UploadData,
        ResultCode::DownloadOk,
        ResultCode::DownloadOkAskInfo,
        ResultCode::SharedDownloadStart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "0",
            ResultCode::GenericError => "-1",
            ResultCode::SignatureFailure => "-3",
            ResultCode::WrongFileSize => "-4",
            ResultCode::Timeout => "-5",
            ResultCode::FileRequestFailure => "-6",
            ResultCode::WrongInput => "-7",
            ResultCode::WrongSpAddress => "-8",
            ResultCode::InternalDataFailure => "-9",
            ResultCode::InternalCommFailure => "-10",
            ResultCode::WrongFileInfo => "-11",
            ResultCode::WrongWalletAddress => "-12",
            ResultCode::UploadData => "1",
            ResultCode::DownloadOk => "2",
            ResultCode::DownloadOkAskInfo => "3",
            ResultCode::SharedDownloadStart => "4",
        }
    }

    pub fn is_error(self) -> bool {
        self.as_str().starts_with('-')
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown result code {0:?}")]
pub struct UnknownResultCode(pub String);

impl FromStr for ResultCode {
    type Err = UnknownResultCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownResultCode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_keep_their_wire_values() {
        assert_eq!(ResultCode::Success.as_str(), "0");
        assert_eq!(ResultCode::GenericError.as_str(), "-1");
        assert_eq!(ResultCode::SignatureFailure.as_str(), "-3");
        assert_eq!(ResultCode::Timeout.as_str(), "-5");
        assert_eq!(ResultCode::WrongSpAddress.as_str(), "-8");
        assert_eq!(ResultCode::WrongWalletAddress.as_str(), "-12");
    }

    #[test]
    fn parses_every_code_back() {
        for code in ResultCode::ALL {
            assert_eq!(code.as_str().parse::<ResultCode>(), Ok(code));
        }
        assert!("-2".parse::<ResultCode>().is_err());
    }

    #[test]
    fn only_negative_codes_are_errors() {
        assert!(!ResultCode::Success.is_error());
        assert!(!ResultCode::DownloadOk.is_error());
        assert!(ResultCode::InternalCommFailure.is_error());
    }
}
