use embassy_time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_CONTEXT_ID: u8 = 1;

/// Access point credentials for the PDP context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Apn<'a> {
    #[default]
    None,
    Given {
        name: &'a str,
        username: Option<&'a str>,
        password: Option<&'a str>,
    },
}

impl<'a> Apn<'a> {
    /// Build an APN, treating empty credentials as absent.
    pub fn new(name: &'a str, username: &'a str, password: &'a str) -> Self {
        let non_empty = |s: &'a str| if s.is_empty() { None } else { Some(s) };
        Apn::Given {
            name,
            username: non_empty(username),
            password: non_empty(password),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NtpConfig<'a> {
    pub server: Option<&'a str>,
    /// Delay between attempts until the first successful sync.
    pub retry_interval: Duration,
    /// Delay between refreshes once synced.
    pub resync_interval: Duration,
}

impl Default for NtpConfig<'_> {
    fn default() -> Self {
        Self {
            server: None,
            retry_interval: Duration::from_secs(10),
            resync_interval: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config<'a> {
    /// Used by every exchange that does not name its own timeout.
    pub timeout: Duration,
    /// Grace period after construction before the first `AT` probe.
    pub init_timeout: Duration,
    pub apn: Apn<'a>,
    /// PDP context bound by the APN step.
    pub context_id: u8,
    pub ntp: NtpConfig<'a>,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            init_timeout: DEFAULT_TIMEOUT,
            apn: Apn::None,
            context_id: DEFAULT_CONTEXT_ID,
            ntp: NtpConfig::default(),
        }
    }
}

impl<'a> Config<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let timeout = if timeout.as_ticks() == 0 {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        Config { timeout, ..self }
    }

    pub fn with_init_timeout(self, init_timeout: Duration) -> Self {
        Config {
            init_timeout,
            ..self
        }
    }

    pub fn with_apn(self, apn: Apn<'a>) -> Self {
        Config { apn, ..self }
    }

    /// Context ids start at 1; 0 falls back to the default.
    pub fn with_context_id(self, context_id: u8) -> Self {
        let context_id = if context_id == 0 {
            DEFAULT_CONTEXT_ID
        } else {
            context_id
        };
        Config { context_id, ..self }
    }

    pub fn with_ntp_server(self, server: &'a str) -> Self {
        Config {
            ntp: NtpConfig {
                server: Some(server),
                ..self.ntp
            },
            ..self
        }
    }

    pub fn with_ntp_intervals(self, retry_interval: Duration, resync_interval: Duration) -> Self {
        Config {
            ntp: NtpConfig {
                retry_interval,
                resync_interval,
                ..self.ntp
            },
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_credentials_become_none() {
        let apn = Apn::new("internet", "", "");
        assert_eq!(
            apn,
            Apn::Given {
                name: "internet",
                username: None,
                password: None
            }
        );
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let config = Config::new().with_timeout(Duration::from_ticks(0));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }
}
