//! Tunable effect parameters.
//!
//! Built-in effect kernels have fixed parameter descriptors; any other effect
//! reports its parameters itself through [`Effect::parameters`].

use super::Effect;
use crate::config::LayerConfig;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// One named, bounded value of an effect, as shown and edited by the overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectParam {
    pub effect_name: String,
    pub name: String,
    pub label: String,
    pub value: ParamValue,
    pub default: ParamValue,
    /// Inclusive bounds for numeric parameters.
    pub range: Option<(f32, f32)>,
}

impl EffectParam {
    pub fn as_f32(&self) -> Option<f32> {
        match self.value {
            ParamValue::Float(v) => Some(v),
            ParamValue::Int(v) => Some(v as f32),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.value {
            ParamValue::Int(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ParamKind {
    Float { default: f32, min: f32, max: f32 },
    Int { default: i32, min: i32, max: i32 },
    Text,
}

#[derive(Debug, Clone, Copy)]
struct ParamDescriptor {
    effect: &'static str,
    name: &'static str,
    label: &'static str,
    kind: ParamKind,
}

const fn float(
    effect: &'static str,
    name: &'static str,
    label: &'static str,
    default: f32,
    min: f32,
    max: f32,
) -> ParamDescriptor {
    ParamDescriptor { effect, name, label, kind: ParamKind::Float { default, min, max } }
}

const fn int(
    effect: &'static str,
    name: &'static str,
    label: &'static str,
    default: i32,
    min: i32,
    max: i32,
) -> ParamDescriptor {
    ParamDescriptor { effect, name, label, kind: ParamKind::Int { default, min, max } }
}

const BUILTIN_PARAMS: &[ParamDescriptor] = &[
    float("cas", "casSharpness", "Sharpness", 0.4, 0.0, 1.0),
    float("dls", "dlsSharpness", "Sharpness", 0.5, 0.0, 1.0),
    float("dls", "dlsDenoise", "Denoise", 0.17, 0.0, 1.0),
    float("fxaa", "fxaaQualitySubpix", "Quality Subpix", 0.75, 0.0, 1.0),
    float("fxaa", "fxaaQualityEdgeThreshold", "Edge Threshold", 0.125, 0.0, 0.5),
    float("fxaa", "fxaaQualityEdgeThresholdMin", "Edge Threshold Min", 0.0312, 0.0, 0.1),
    float("smaa", "smaaThreshold", "Threshold", 0.05, 0.0, 0.5),
    int("smaa", "smaaMaxSearchSteps", "Max Search Steps", 32, 0, 112),
    int("smaa", "smaaMaxSearchStepsDiag", "Max Search Steps Diag", 16, 0, 20),
    int("smaa", "smaaCornerRounding", "Corner Rounding", 25, 0, 100),
    float("deband", "debandAvgdiff", "Avg Diff", 3.4, 0.0, 255.0),
    float("deband", "debandMaxdiff", "Max Diff", 6.8, 0.0, 255.0),
    float("deband", "debandMiddiff", "Mid Diff", 3.3, 0.0, 255.0),
    float("deband", "debandRange", "Range", 16.0, 1.0, 64.0),
    int("deband", "debandIterations", "Iterations", 4, 1, 16),
    ParamDescriptor { effect: "lut", name: "lutFile", label: "LUT File", kind: ParamKind::Text },
];

/// Whether `effect_name` is one of the kernels with fixed descriptors.
pub fn is_builtin(effect_name: &str) -> bool {
    BUILTIN_PARAMS.iter().any(|d| d.effect == effect_name)
}

fn warn_clamped<T: std::fmt::Display>(
    descriptor: &ParamDescriptor,
    requested: T,
    min: T,
    max: T,
    value: T,
) {
    tracing::warn!(
        "{}.{} = {} out of [{}, {}], clamped to {}",
        descriptor.effect,
        descriptor.name,
        requested,
        min,
        max,
        value
    );
}

fn resolve(descriptor: &ParamDescriptor, config: &LayerConfig) -> EffectParam {
    let (value, default, range) = match descriptor.kind {
        ParamKind::Float { default, min, max } => {
            let requested = config
                .param_f32(descriptor.effect, descriptor.name)
                .unwrap_or(default);
            let value = requested.clamp(min, max);
            if value != requested {
                warn_clamped(descriptor, requested, min, max, value);
            }
            (ParamValue::Float(value), ParamValue::Float(default), Some((min, max)))
        }
        ParamKind::Int { default, min, max } => {
            let requested = config
                .param_i32(descriptor.effect, descriptor.name)
                .unwrap_or(default);
            let value = requested.clamp(min, max);
            if value != requested {
                warn_clamped(descriptor, requested, min, max, value);
            }
            (ParamValue::Int(value), ParamValue::Int(default), Some((min as f32, max as f32)))
        }
        ParamKind::Text => {
            let value = config.param_str(descriptor.effect, descriptor.name).unwrap_or_default();
            (ParamValue::Text(value.to_string()), ParamValue::Text(String::new()), None)
        }
    };
    EffectParam {
        effect_name: descriptor.effect.to_string(),
        name: descriptor.name.to_string(),
        label: descriptor.label.to_string(),
        value,
        default,
        range,
    }
}

/// Resolved parameters of a built-in kernel, overrides applied and clamped.
pub fn builtin_parameters(effect_name: &str, config: &LayerConfig) -> Vec<EffectParam> {
    BUILTIN_PARAMS
        .iter()
        .filter(|d| d.effect == effect_name)
        .map(|d| resolve(d, config))
        .collect()
}

/// Parameters of every effect in `effect_names`, in chain order.
pub fn collect_effect_parameters(
    config: &LayerConfig,
    effect_names: &[String],
    effects: &[Box<dyn Effect>],
) -> Vec<EffectParam> {
    let mut parameters = Vec::new();
    for effect_name in effect_names {
        if is_builtin(effect_name) {
            parameters.extend(builtin_parameters(effect_name, config));
        } else {
            parameters.extend(
                effects
                    .iter()
                    .filter(|effect| effect.name() == effect_name)
                    .flat_map(|effect| effect.parameters())
                    .filter(|param| &param.effect_name == effect_name),
            );
        }
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use ash::vk;

    struct UserShader {
        name: String,
    }

    impl Effect for UserShader {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply(&mut self, _image_index: usize, _cmd: vk::CommandBuffer) {}

        fn parameters(&self) -> Vec<EffectParam> {
            vec![EffectParam {
                effect_name: self.name.clone(),
                name: "strength".to_string(),
                label: "Strength".to_string(),
                value: ParamValue::Float(0.3),
                default: ParamValue::Float(0.3),
                range: Some((0.0, 1.0)),
            }]
        }
    }

    #[test]
    fn builtin_defaults_without_overrides() {
        let params = builtin_parameters("smaa", &LayerConfig::default());
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            ["smaaThreshold", "smaaMaxSearchSteps", "smaaMaxSearchStepsDiag", "smaaCornerRounding"]
        );
        assert_eq!(params[1].value, ParamValue::Int(32));
        assert_eq!(params[1].range, Some((0.0, 112.0)));
    }

    #[test]
    fn overrides_apply_and_are_clamped() {
        let config = ConfigLoader::load_from_str(
            "[params]\ncasSharpness = 3.0\n\"deband.debandIterations\" = 8\n",
        )
        .unwrap();
        let cas = builtin_parameters("cas", &config);
        assert_eq!(cas[0].value, ParamValue::Float(1.0));
        assert_eq!(cas[0].default, ParamValue::Float(0.4));

        let deband = builtin_parameters("deband", &config);
        let iterations = deband.iter().find(|p| p.name == "debandIterations").unwrap();
        assert_eq!(iterations.as_i32(), Some(8));
    }

    #[test]
    fn lut_file_is_a_text_parameter() {
        let config =
            ConfigLoader::load_from_str("[params]\nlutFile = \"/luts/warm.cube\"\n").unwrap();
        let lut = builtin_parameters("lut", &config);
        assert_eq!(lut.len(), 1);
        assert_eq!(lut[0].value, ParamValue::Text("/luts/warm.cube".to_string()));
        assert_eq!(lut[0].range, None);
    }

    #[test]
    fn non_builtin_parameters_come_from_the_effect() {
        let effects: Vec<Box<dyn Effect>> =
            vec![Box::new(UserShader { name: "vignette".to_string() })];
        let names = vec!["cas".to_string(), "vignette".to_string(), "missing".to_string()];
        let params = collect_effect_parameters(&LayerConfig::default(), &names, &effects);
        let qualified: Vec<String> = params
            .iter()
            .map(|p| format!("{}.{}", p.effect_name, p.name))
            .collect();
        assert_eq!(qualified, ["cas.casSharpness", "vignette.strength"]);
    }
}
