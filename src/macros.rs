//! Declarative helpers for the protocol's closed value sets
//! (command codes, protocol versions and numeric error codes).

/// Declares `CommandType` as a `u32`-backed enum with lookup by code.
macro_rules! define_command_type {
    ($($name:ident = $code:literal),+ $(,)?) => {
        /// Tuya frame command codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $code),+
        }

        impl CommandType {
            /// Looks up a command by its wire code.
            pub fn from_u32(code: u32) -> Option<Self> {
                match code {
                    $($code => Some(CommandType::$name),)+
                    _ => None,
                }
            }
        }

        impl From<CommandType> for u32 {
            fn from(cmd: CommandType) -> u32 {
                cmd as u32
            }
        }
    };
}

/// Declares `Version` with its textual form, wire bytes and numeric value.
macro_rules! define_version {
    ($($name:ident = ($text:literal, $val:literal)),+ $(,)?) => {
        /// Local protocol revision.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name),+
        }

        impl Version {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $text),+
                }
            }

            /// Version tag as it appears at the head of protocol headers.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$name => $val),+
                }
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok(Version::$name),)+
                    other => Err($crate::error::TuyaError::InvalidConfig(format!(
                        "unsupported protocol version '{}'",
                        other
                    ))),
                }
            }
        }

        impl serde::Serialize for Version {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for Version {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Declares numeric error-code constants and `get_error_message`.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),+ $(,)?) => {
        $(pub const $name: u32 = $code;)+

        /// Human readable text for a numeric error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)+
                _ => "Unknown Error",
            }
        }
    };
}
