//! Time-interval measurement between the PPS outputs of the master and the
//! slave.

use crate::error::InstrumentError;

/// An instrument able to measure the skew between two PPS edges, such as an
/// oscilloscope or a time-interval counter. Input 1 is wired to the master
/// PPS output, input 2 to the slave one.
pub trait MeasurementInstrument {
    /// Determines a trigger level for each input, given the expected signal
    /// range in volts.
    fn trigger_level(&mut self, v_min: f64, v_max: f64) -> Result<(f64, f64), InstrumentError>;

    /// Takes `n_samples` measurements, `t_samples` seconds apart, and returns
    /// the mean interval from the master edge to the slave edge, in seconds.
    fn mean_time_interval(
        &mut self,
        n_samples: u32,
        t_samples: f64,
        trig1: f64,
        trig2: f64,
    ) -> Result<f64, InstrumentError>;
}
