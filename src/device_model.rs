use crate::acquisition::AcquisitionEngine;
use crate::calibration::CalibrationSource;
use crate::control_command::ControlCommand;
use crate::specification::DeviceSpecification;
use std::fmt;
use std::sync::Arc;

/// Commands every DSO-6022 variant needs, in dispatch order.
const DSO6022_COMMANDS: [ControlCommand; 6] = [
    ControlCommand::AcquireHardData,
    ControlCommand::SetTimeDiv,
    ControlCommand::SetVoltDivCh2,
    ControlCommand::SetVoltDivCh1,
    ControlCommand::SetNumChannels,
    ControlCommand::SetCalFreq,
];

/// Calibration scope shared by all DSO-6022 variants.
const DSO6022_CALIBRATION_SCOPE: &str = "modelDSO6022";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelIdentity {
    pub model_id: u32,
    /// IDs enumerated once our firmware is running.
    pub in_use: UsbId,
    /// IDs enumerated straight after power-up, before firmware upload.
    pub stock: UsbId,
    pub firmware_version: u16,
    pub firmware_token: &'static str,
    pub display_name: &'static str,
    pub calibration_scope: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    Dso6022Be,
    Dso6022Bl,
    /// LCsoft EZ-USB board without EEPROM.
    #[cfg(feature = "lcsoft-test-board")]
    LcSoftEzUsb,
    /// LCsoft EZ-USB board with a Saleae VID/PID EEPROM.
    #[cfg(feature = "lcsoft-test-board")]
    LcSoftSaleae,
}

impl ModelVariant {
    pub const ALL: &'static [Self] = &[
        Self::Dso6022Be,
        Self::Dso6022Bl,
        #[cfg(feature = "lcsoft-test-board")]
        Self::LcSoftEzUsb,
        #[cfg(feature = "lcsoft-test-board")]
        Self::LcSoftSaleae,
    ];

    pub const fn identity(self) -> ModelIdentity {
        let (model_id, in_use, stock, firmware_token, display_name) = match self {
            Self::Dso6022Be => (
                0x6022,
                UsbId::new(0x04b5, 0x6022),
                UsbId::new(0x04b4, 0x6022),
                "dso6022be",
                "DSO-6022BE",
            ),
            Self::Dso6022Bl => (
                0x602a,
                UsbId::new(0x04b5, 0x602a),
                UsbId::new(0x04b4, 0x602a),
                "dso6022bl",
                "DSO-6022BL",
            ),
            #[cfg(feature = "lcsoft-test-board")]
            Self::LcSoftEzUsb => (
                0x6022,
                UsbId::new(0x04b5, 0x6022),
                UsbId::new(0x04b4, 0x8613),
                "dso6022be",
                "LCsoft-EzUSB",
            ),
            #[cfg(feature = "lcsoft-test-board")]
            Self::LcSoftSaleae => (
                0x6022,
                UsbId::new(0x04b5, 0x6022),
                UsbId::new(0x0925, 0x3881),
                "dso6022be",
                "LCsoft-Saleae",
            ),
        };
        ModelIdentity {
            model_id,
            in_use,
            stock,
            firmware_version: 0x0201,
            firmware_token,
            display_name,
            calibration_scope: DSO6022_CALIBRATION_SCOPE,
        }
    }
}

/// How a detected USB ID matched a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityMatch {
    /// The device still needs its firmware uploaded.
    Stock,
    /// The device is running firmware and ready for commands.
    InUse,
}

#[derive(Debug)]
pub struct DeviceModel {
    variant: ModelVariant,
    identity: ModelIdentity,
    specification: DeviceSpecification,
}

impl DeviceModel {
    /// Build a model, applying calibration stored for its scope.
    pub fn new(variant: ModelVariant, calibration: &dyn CalibrationSource) -> Self {
        let identity = variant.identity();
        let section = calibration.section(identity.calibration_scope);
        log::debug!(
            "Initializing {} ({} calibration entries)",
            identity.display_name,
            section.as_ref().map_or(0, |section| section.len())
        );
        Self {
            variant,
            identity,
            specification: DeviceSpecification::dso6022(section.as_ref()),
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn identity(&self) -> &ModelIdentity {
        &self.identity
    }

    pub fn name(&self) -> &'static str {
        self.identity.display_name
    }

    pub fn specification(&self) -> &DeviceSpecification {
        &self.specification
    }

    /// Register the commands this model needs with `engine`.
    pub fn apply_requirements(&self, engine: &mut AcquisitionEngine) {
        for command in DSO6022_COMMANDS {
            engine.add_command(command);
        }
    }

    pub fn matches(&self, id: UsbId) -> Option<IdentityMatch> {
        if id == self.identity.in_use {
            Some(IdentityMatch::InUse)
        } else if id == self.identity.stock {
            Some(IdentityMatch::Stock)
        } else {
            None
        }
    }
}

/// Every supported model, built once and shared by reference.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<Arc<DeviceModel>>,
}

impl ModelRegistry {
    pub fn new(calibration: &dyn CalibrationSource) -> Self {
        Self {
            models: ModelVariant::ALL
                .iter()
                .map(|&variant| Arc::new(DeviceModel::new(variant, calibration)))
                .collect(),
        }
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<DeviceModel>> {
        self.models.iter()
    }

    /// Find the model a detected device belongs to.
    ///
    /// Running devices are matched first: the test boards share the in-use IDs
    /// of the DSO-6022BE but not its stock IDs.
    pub fn find(&self, id: UsbId) -> Option<(Arc<DeviceModel>, IdentityMatch)> {
        let by_kind = |kind| {
            self.models
                .iter()
                .find(|model| model.matches(id) == Some(kind))
                .map(|model| (Arc::clone(model), kind))
        };
        by_kind(IdentityMatch::InUse).or_else(|| by_kind(IdentityMatch::Stock))
    }

    pub fn by_variant(&self, variant: ModelVariant) -> Option<Arc<DeviceModel>> {
        self.models
            .iter()
            .find(|model| model.variant == variant)
            .cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<DeviceModel>> {
        self.models
            .iter()
            .find(|model| model.name().eq_ignore_ascii_case(name))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationCategory, MemoryCalibration};
    use crate::specification::VoltageRange;

    #[test]
    fn test_identities() {
        let be = ModelVariant::Dso6022Be.identity();
        assert_eq!(be.model_id, 0x6022);
        assert_eq!(be.in_use, UsbId::new(0x04b5, 0x6022));
        assert_eq!(be.stock, UsbId::new(0x04b4, 0x6022));
        assert_eq!(be.firmware_version, 0x0201);
        assert_eq!(be.firmware_token, "dso6022be");

        let bl = ModelVariant::Dso6022Bl.identity();
        assert_eq!(bl.in_use.to_string(), "04b5:602a");
        assert_eq!(bl.display_name, "DSO-6022BL");
    }

    #[test]
    fn test_variants_share_specification() {
        let mut calibration = MemoryCalibration::new();
        calibration.set(
            "modelDSO6022",
            CalibrationCategory::Gain,
            0,
            VoltageRange::MilliVolts1000,
            "1.1",
        );
        let registry = ModelRegistry::new(&calibration);
        let specs: Vec<_> = registry.models().map(|model| model.specification()).collect();
        assert_eq!(specs.len(), ModelVariant::ALL.len());
        assert!(specs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(specs[0].voltage_limit[0][5], 198.0 / 1.1);
    }

    #[test]
    fn test_registry_matches_stock_and_in_use_ids() {
        let registry = ModelRegistry::new(&MemoryCalibration::new());

        let (model, kind) = registry.find(UsbId::new(0x04b4, 0x602a)).unwrap();
        assert_eq!(model.variant(), ModelVariant::Dso6022Bl);
        assert_eq!(kind, IdentityMatch::Stock);

        let (model, kind) = registry.find(UsbId::new(0x04b5, 0x6022)).unwrap();
        assert_eq!(model.variant(), ModelVariant::Dso6022Be);
        assert_eq!(kind, IdentityMatch::InUse);

        assert!(registry.find(UsbId::new(0x1234, 0x5678)).is_none());
    }

    #[test]
    fn test_registry_hands_out_shared_instances() {
        let registry = ModelRegistry::new(&MemoryCalibration::new());
        let first = registry.by_variant(ModelVariant::Dso6022Be).unwrap();
        let second = registry.by_name("dso-6022be").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_apply_requirements_registers_command_set_in_order() {
        let registry = ModelRegistry::new(&MemoryCalibration::new());
        let engine = AcquisitionEngine::new(registry.by_variant(ModelVariant::Dso6022Bl).unwrap());
        assert_eq!(engine.commands(), &DSO6022_COMMANDS);
    }
}
