//! Built-in layer classes.

pub mod activation;
pub mod attention;
pub mod choice;
pub mod compare;
pub mod copy;
pub mod decide;
pub mod last_state;
pub mod linear;
pub mod rnn_cell;
pub mod softmax;

use crate::error::Result;
use crate::network::layer::LayerRef;
use crate::network::rec;
use crate::network::registry::{LayerClass, NetCtx};
use crate::network::value::Data;

pub use activation::Activation;

/// Every built-in class.
pub fn builtin() -> Vec<LayerClass> {
    vec![
        linear::CLASS,
        softmax::CLASS,
        activation::CLASS,
        copy::CLASS,
        compare::CLASS,
        rnn_cell::CLASS,
        rec::CLASS,
        attention::CLASS,
        choice::CLASS,
        decide::CLASS,
        last_state::CLASS,
    ]
}

/// Lengths of the first source with a time axis.
pub(crate) fn first_lengths(sources: &[Data]) -> Option<Vec<usize>> {
    sources.iter().find_map(|s| s.lengths.clone())
}

/// Whether any source has a time axis. Inside a recurrent unit nothing has
/// one, and sources are not inspected so that `prev:` cycles stay
/// resolvable.
pub(crate) fn sources_have_time(sources: &[LayerRef], ctx: &mut dyn NetCtx) -> Result<bool> {
    if ctx.in_unit() {
        return Ok(false);
    }
    for source in sources {
        if ctx.spec(source)?.time_axis {
            return Ok(true);
        }
    }
    Ok(false)
}
