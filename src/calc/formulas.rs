//! Built-in hydrology calculations run through the Python preamble.

use std::collections::HashMap;
use std::fmt;

use serde_json::{json, Value as JsonValue};

const RATIONAL_CODE: &str = r#"p = load_input()
c, i, a = p["c"], p["intensity"], p["area"]
q = c * i * a
print(f"Q = {q:.2f} cfs")
write_result(
    f"Peak runoff Q = C x i x A = {c} x {i} in/hr x {a} ac = {q:.2f} cfs",
    insights=[
        f"Runoff coefficient C = {c}",
        f"Rainfall intensity i = {i} in/hr",
        f"Drainage area A = {a} acres",
    ],
    recommendations=[f"Size conveyance and inlet protection for at least {q:.2f} cfs"],
)
"#;

const SCS_CODE: &str = r#"p = load_input()
precip, cn = p["precipitation"], p["curve_number"]
s = 1000.0 / cn - 10.0
ia = 0.2 * s
q = (precip - ia) ** 2 / (precip + 0.8 * s) if precip > ia else 0.0
print(f"Q = {q:.2f} in")
insights = [
    f"Potential maximum retention S = {s:.2f} in",
    f"Initial abstraction Ia = {ia:.2f} in",
]
recs = []
if q == 0.0:
    insights.append("Rainfall does not exceed initial abstraction; no direct runoff")
else:
    recs.append(f"Plan BMP capacity for {q:.2f} in of runoff depth")
write_result(
    f"SCS runoff depth Q = {q:.2f} in for P = {precip} in, CN = {cn}",
    insights=insights,
    recommendations=recs,
)
"#;

const DETENTION_CODE: &str = r#"p = load_input()
qin, qout, minutes = p["inflow_cfs"], p["outflow_cfs"], p["duration_min"]
volume = max(qin - qout, 0.0) * minutes * 60.0 / 2.0
print(f"V = {volume:.0f} cf")
write_result(
    f"Required detention storage V = {volume:.0f} cubic feet ({volume / 43560.0:.3f} ac-ft)",
    insights=[
        f"Peak inflow {qin} cfs, allowable outflow {qout} cfs",
        f"Storm duration {minutes} minutes",
    ],
    recommendations=[f"Provide at least {volume:.0f} cf of detention storage"] if volume > 0 else [],
)
"#;

/// A hydrology formula with validated inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    /// Peak flow Q = C·i·A (cfs).
    Rational { c: f64, intensity: f64, area: f64 },
    /// SCS curve number runoff depth (inches).
    ScsRunoff { precipitation: f64, curve_number: f64 },
    /// Triangular hydrograph detention volume (cubic feet).
    Detention {
        inflow_cfs: f64,
        outflow_cfs: f64,
        duration_min: f64,
    },
}

impl Formula {
    pub const NAMES: [&'static str; 3] = ["rational", "scs", "detention"];

    /// Build a formula from its name and a `key=value key=value` parameter string.
    pub fn from_params(name: &str, params: &str) -> Result<Self, String> {
        let values = parse_pairs(params)?;
        let get = |keys: &[&str]| -> Result<f64, String> {
            keys.iter()
                .find_map(|k| values.get(*k).copied())
                .ok_or_else(|| format!("missing parameter `{}`", keys[0]))
        };

        let formula = match name.trim().to_lowercase().as_str() {
            "rational" => Formula::Rational {
                c: get(&["c"])?,
                intensity: get(&["i", "intensity"])?,
                area: get(&["a", "area"])?,
            },
            "scs" | "scs-runoff" | "scs_runoff" | "curve_number" => Formula::ScsRunoff {
                precipitation: get(&["p", "precipitation"])?,
                curve_number: get(&["cn", "curve_number"])?,
            },
            "detention" => Formula::Detention {
                inflow_cfs: get(&["qin", "inflow"])?,
                outflow_cfs: get(&["qout", "outflow"])?,
                duration_min: get(&["t", "duration"])?,
            },
            other => {
                return Err(format!(
                    "Unknown formula `{}`. Valid: {}",
                    other,
                    Self::NAMES.join(", ")
                ))
            }
        };
        formula.validate()?;
        Ok(formula)
    }

    fn validate(&self) -> Result<(), String> {
        match *self {
            Formula::Rational { c, intensity, area } => {
                if !(0.0..=1.0).contains(&c) {
                    return Err("runoff coefficient `c` must be between 0 and 1".into());
                }
                if intensity <= 0.0 || area <= 0.0 {
                    return Err("intensity and area must be positive".into());
                }
            }
            Formula::ScsRunoff {
                precipitation,
                curve_number,
            } => {
                if curve_number <= 0.0 || curve_number > 100.0 {
                    return Err("curve number `cn` must be in (0, 100]".into());
                }
                if precipitation < 0.0 {
                    return Err("precipitation cannot be negative".into());
                }
            }
            Formula::Detention {
                inflow_cfs,
                outflow_cfs,
                duration_min,
            } => {
                if inflow_cfs < 0.0 || outflow_cfs < 0.0 {
                    return Err("flows cannot be negative".into());
                }
                if duration_min <= 0.0 {
                    return Err("duration must be positive".into());
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Formula::Rational { .. } => "rational",
            Formula::ScsRunoff { .. } => "scs",
            Formula::Detention { .. } => "detention",
        }
    }

    /// Script body, run after the preamble.
    pub fn code(&self) -> &'static str {
        match self {
            Formula::Rational { .. } => RATIONAL_CODE,
            Formula::ScsRunoff { .. } => SCS_CODE,
            Formula::Detention { .. } => DETENTION_CODE,
        }
    }

    /// Input payload read by `load_input()`.
    pub fn input(&self) -> JsonValue {
        match *self {
            Formula::Rational { c, intensity, area } => {
                json!({ "c": c, "intensity": intensity, "area": area })
            }
            Formula::ScsRunoff {
                precipitation,
                curve_number,
            } => json!({ "precipitation": precipitation, "curve_number": curve_number }),
            Formula::Detention {
                inflow_cfs,
                outflow_cfs,
                duration_min,
            } => json!({
                "inflow_cfs": inflow_cfs,
                "outflow_cfs": outflow_cfs,
                "duration_min": duration_min,
            }),
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Formula::Rational { c, intensity, area } => {
                write!(f, "Rational method (C={}, i={} in/hr, A={} ac)", c, intensity, area)
            }
            Formula::ScsRunoff {
                precipitation,
                curve_number,
            } => write!(f, "SCS runoff (P={} in, CN={})", precipitation, curve_number),
            Formula::Detention {
                inflow_cfs,
                outflow_cfs,
                duration_min,
            } => write!(
                f,
                "Detention volume (Qin={} cfs, Qout={} cfs, t={} min)",
                inflow_cfs, outflow_cfs, duration_min
            ),
        }
    }
}

fn parse_pairs(params: &str) -> Result<HashMap<String, f64>, String> {
    params
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got `{}`", pair))?;
            let v: f64 = v
                .parse()
                .map_err(|_| format!("`{}` is not a number", v))?;
            if !v.is_finite() {
                return Err(format!("`{}` must be finite", k));
            }
            Ok((k.to_lowercase(), v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rational_params_and_aliases() {
        let f = Formula::from_params("rational", "c=0.9 i=2.5 a=1.2").unwrap();
        assert_eq!(f, Formula::Rational { c: 0.9, intensity: 2.5, area: 1.2 });

        let g = Formula::from_params("Rational", "C=0.9, intensity=2.5, area=1.2").unwrap();
        assert_eq!(f, g);
        assert_eq!(f.input()["intensity"], 2.5);
    }

    #[test]
    fn test_scs_and_detention_parse() {
        let scs = Formula::from_params("scs", "p=3.5 cn=80").unwrap();
        assert_eq!(scs.name(), "scs");
        assert_eq!(scs.input()["curve_number"], 80.0);

        let det = Formula::from_params("detention", "qin=12 qout=4 t=60").unwrap();
        assert!(det.code().contains("write_result("));
        assert!(det.to_string().contains("Qin=12"));
    }

    #[test]
    fn test_validation_errors() {
        assert!(Formula::from_params("rational", "c=1.5 i=2 a=1").unwrap_err().contains("between 0 and 1"));
        assert!(Formula::from_params("scs", "p=3 cn=0").is_err());
        assert!(Formula::from_params("detention", "qin=5 qout=1 t=0").is_err());
        assert!(Formula::from_params("rational", "c=0.5 i=2").unwrap_err().contains("`a`"));
        assert!(Formula::from_params("rational", "c=high i=2 a=1").unwrap_err().contains("not a number"));
        assert!(Formula::from_params("manning", "n=0.013").unwrap_err().contains("Unknown formula"));
    }

    #[test]
    fn test_scripts_use_preamble_helpers() {
        for f in [
            Formula::Rational { c: 0.5, intensity: 1.0, area: 1.0 },
            Formula::ScsRunoff { precipitation: 2.0, curve_number: 75.0 },
            Formula::Detention { inflow_cfs: 3.0, outflow_cfs: 1.0, duration_min: 30.0 },
        ] {
            assert!(f.code().starts_with("p = load_input()"));
            assert!(f.code().contains("write_result("));
        }
    }
}
