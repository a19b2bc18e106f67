use owo_colors::{OwoColorize, Style as OwoStyle};

use crate::model::ConnectionState;
use crate::sync::BridgeState;

/// Applies colour and style to terminal text.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    /// Creates a painter with explicit colour control.
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().cyan())
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().green())
    }

    pub(crate) fn warning<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold().yellow())
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().dimmed())
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text.as_ref(), OwoStyle::new().bold())
    }

    /// Colours a link state: green when up, yellow while connecting.
    pub(crate) fn connection(&self, state: ConnectionState) -> String {
        let text = state.to_string();
        match state {
            ConnectionState::Connected => self.success(text),
            ConnectionState::Connecting => self.warning(text),
            ConnectionState::Disconnected => self.muted(text),
        }
    }

    pub(crate) fn bridge(&self, state: BridgeState) -> String {
        let text = state.to_string();
        match state {
            BridgeState::Bound => self.success(text),
            BridgeState::Idle => self.muted(text),
            BridgeState::ServicesDiscovering | BridgeState::CharacteristicsDiscovering => {
                self.warning(text)
            }
        }
    }

    fn paint(&self, text: &str, style: OwoStyle) -> String {
        if self.use_colour {
            format!("{}", text.style(style))
        } else {
            text.to_string()
        }
    }
}
