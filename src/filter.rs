//! The filter contract: lifecycle states and the callback trait every
//! pipeline filter implements.

use crate::error::Result;
use crate::ports::InputPort;

/// Position of a filter in the lifecycle sequence.
///
/// States advance strictly along the forward sequence
/// `Constructing .. Active` and back down through the reverse transitions;
/// the transitional states (`Initializing`, `Opening`, ...) are visible to
/// filter code during the corresponding callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterState {
    Constructing,
    Constructed,
    Initializing,
    Initialized,
    Opening,
    Opened,
    Starting,
    Active,
    Stopping,
    Closing,
    Deinitializing,
    Destructing,
    Destructed,
}

impl std::fmt::Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FilterState::Constructing => "Constructing",
            FilterState::Constructed => "Constructed",
            FilterState::Initializing => "Initializing",
            FilterState::Initialized => "Initialized",
            FilterState::Opening => "Opening",
            FilterState::Opened => "Opened",
            FilterState::Starting => "Starting",
            FilterState::Active => "Active",
            FilterState::Stopping => "Stopping",
            FilterState::Closing => "Closing",
            FilterState::Deinitializing => "Deinitializing",
            FilterState::Destructing => "Destructing",
            FilterState::Destructed => "Destructed",
        };
        f.write_str(s)
    }
}

impl FilterState {
    /// True for the states in which ports may still be added or removed and
    /// the inter-thread queue mode may be changed.
    pub fn allows_port_changes(self) -> bool {
        matches!(
            self,
            FilterState::Constructing
                | FilterState::Constructed
                | FilterState::Initializing
                | FilterState::Initialized
        )
    }
}

/// Trait implemented by every pipeline filter.
///
/// All callbacks are invoked on the filter's owning thread. The defaults are
/// no-ops, so a filter only overrides the hooks it needs:
///
/// ```ignore
/// struct Doubler {
///     input: InputPort,
///     output: OutputPort,
/// }
///
/// impl Filter for Doubler {
///     fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
///         let sample = port.get_data(0, -1.0)?;
///         self.output.transmit(&DataSample::copy(&sample))?;
///         Ok(())
///     }
/// }
/// ```
///
/// A factory constructs the filter with its environment handle; the
/// constructor creates static ports and registers them via
/// `FilterEnvironment::add_port`.
#[allow(unused_variables)]
pub trait Filter: Send {
    /// Initialization related to dynamic ports.
    fn on_init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Acquire resources needed while the graph is open (files, devices).
    fn on_open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Last hook before data starts flowing.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called exactly once for each data sample arriving at an input port.
    fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
        Ok(())
    }

    /// Inverse of [`Filter::on_start`].
    fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Inverse of [`Filter::on_open`].
    fn on_close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Inverse of [`Filter::on_init`].
    fn on_deinit(&mut self) -> Result<()> {
        Ok(())
    }
}
