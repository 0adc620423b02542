// Target masking, unit scaling and relative error per EVE channel.
use ndarray::{Array1, Array2, Axis, Zip};

use crate::error::PipelineError;

/// `true` where EVE reported no reading (negative sentinel).
pub fn validity_mask(y: &Array2<f64>) -> Array2<bool> {
    y.mapv(|v| v < 0.0)
}

/// Copy of `y` with every masked entry set to zero.
pub fn mask_and_zero(y: &Array2<f64>, mask: &Array2<bool>) -> Array2<f64> {
    let mut out = y.clone();
    Zip::from(&mut out).and(mask).for_each(|v, &m| {
        if m {
            *v = 0.0;
        }
    });
    out
}

pub fn scale(y: &Array2<f64>, factor: f64) -> Array2<f64> {
    y.mapv(|v| v * factor)
}

/// Mean of `|yhat - y| / y` per column in percent, skipping masked and NaN entries.
/// A column with nothing left to average is NaN.
pub fn relative_error(
    yhat: &Array2<f64>,
    y: &Array2<f64>,
    mask: &Array2<bool>,
) -> Result<Array1<f64>, PipelineError> {
    for (context, expected, found) in [
        ("prediction rows", y.nrows(), yhat.nrows()),
        ("prediction columns", y.ncols(), yhat.ncols()),
        ("validity mask rows", y.nrows(), mask.nrows()),
        ("validity mask columns", y.ncols(), mask.ncols()),
    ] {
        if expected != found {
            return Err(PipelineError::Shape {
                context,
                expected,
                found,
            });
        }
    }

    let errors = Zip::from(yhat.lanes(Axis(0)))
        .and(y.lanes(Axis(0)))
        .and(mask.lanes(Axis(0)))
        .map_collect(|p, t, m| {
            let (sum, count) = Zip::from(p)
                .and(t)
                .and(m)
                .fold((0.0, 0usize), |(sum, count), &p, &t, &m| {
                    let e = (p - t).abs() / t;
                    if m || e.is_nan() {
                        (sum, count)
                    } else {
                        (sum + e, count + 1)
                    }
                });
            if count == 0 {
                f64::NAN
            } else {
                sum / count as f64 * 100.0
            }
        });
    Ok(errors)
}
