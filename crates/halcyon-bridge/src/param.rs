//! Host-side mirror of the bridged plugin's parameter catalog.
//!
//! Built from the client's descriptor burst (`ParameterCount` then
//! `ParameterData1`/`ParameterData2`/`ParameterRanges`/`ParameterValue2`
//! per parameter), mutated by client value updates and host user input,
//! dropped with the plugin.

use crate::protocol::ParameterType;

#[derive(Debug, Clone)]
pub struct BridgeParamInfo {
    pub index: u32,
    pub rindex: i32,
    pub param_type: ParameterType,
    pub hints: u32,
    pub midi_channel: u8,
    pub mapped_control_index: i16,
    pub mapped_min: f32,
    pub mapped_max: f32,
    pub min: f32,
    pub max: f32,
    pub def: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
    pub value: f32,
    pub name: String,
    pub symbol: String,
    pub unit: String,
}

impl Default for BridgeParamInfo {
    fn default() -> Self {
        Self {
            index: 0,
            rindex: -1,
            param_type: ParameterType::Input,
            hints: 0,
            midi_channel: 0,
            mapped_control_index: -1,
            mapped_min: 0.0,
            mapped_max: 1.0,
            min: 0.0,
            max: 1.0,
            def: 0.0,
            step: 0.01,
            step_small: 0.001,
            step_large: 0.1,
            value: 0.0,
            name: String::new(),
            symbol: String::new(),
            unit: String::new(),
        }
    }
}

impl BridgeParamInfo {
    /// Enforce the range invariants: min < max, min <= def <= max.
    /// Broken metadata from a plugin is repaired rather than trusted.
    pub fn sanitize_ranges(&mut self) {
        if !self.min.is_finite() {
            self.min = 0.0;
        }
        if !self.max.is_finite() || self.max <= self.min {
            self.max = self.min + 1.0;
        }
        if !self.def.is_finite() {
            self.def = self.min;
        }
        self.def = self.def.clamp(self.min, self.max);
        self.value = self.value.clamp(self.min, self.max);
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    pub fn is_input(&self) -> bool {
        self.param_type == ParameterType::Input
    }
}

/// The catalog itself. Exists once `ParameterCount` arrives and keeps its
/// size until the plugin goes away.
#[derive(Debug, Default)]
pub struct ParamCatalog {
    params: Vec<BridgeParamInfo>,
}

impl ParamCatalog {
    pub fn reset(&mut self, count: u32) {
        self.params = (0..count)
            .map(|index| BridgeParamInfo { index, ..Default::default() })
            .collect();
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&BridgeParamInfo> {
        self.params.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut BridgeParamInfo> {
        self.params.get_mut(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BridgeParamInfo> {
        self.params.iter()
    }

    /// Clamp `value` against the catalog entry, or pass it through when the
    /// index is unknown (the client re-clamps anyway).
    pub fn clamp_value(&self, index: u32, value: f32) -> f32 {
        match self.get(index) {
            Some(param) => param.clamp(value),
            None => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_reset_indices() {
        let mut catalog = ParamCatalog::default();
        catalog.reset(4);
        assert_eq!(catalog.len(), 4);
        for (i, param) in catalog.iter().enumerate() {
            assert_eq!(param.index, i as u32);
        }
        assert!(catalog.get(4).is_none());
    }

    #[test]
    fn test_sanitize_repairs_inverted_range() {
        let mut param = BridgeParamInfo {
            min: 2.0,
            max: 1.0,
            def: 5.0,
            ..Default::default()
        };
        param.sanitize_ranges();
        assert!(param.min < param.max);
        assert!(param.def >= param.min && param.def <= param.max);
    }

    #[test]
    fn test_sanitize_repairs_non_finite() {
        let mut param = BridgeParamInfo {
            min: f32::NAN,
            max: f32::INFINITY,
            def: f32::NAN,
            ..Default::default()
        };
        param.sanitize_ranges();
        assert!(param.min.is_finite());
        assert!(param.max.is_finite());
        assert!(param.def.is_finite());
    }

    #[test]
    fn test_clamp_value_against_catalog() {
        let mut catalog = ParamCatalog::default();
        catalog.reset(1);
        {
            let p = catalog.get_mut(0).unwrap();
            p.min = -1.0;
            p.max = 1.0;
        }
        assert_eq!(catalog.clamp_value(0, 3.0), 1.0);
        assert_eq!(catalog.clamp_value(0, -3.0), -1.0);
        assert_eq!(catalog.clamp_value(0, 0.25), 0.25);
        // Unknown index passes through.
        assert_eq!(catalog.clamp_value(9, 3.0), 3.0);
    }
}
