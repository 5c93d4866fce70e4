/// How a tag's value is laid out in consecutive 16-bit registers.
///
/// Multi-register values are big-endian in both byte and word order, which is what the reactor
/// PLCs (and the simulator) use.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "u16")]
    Uint16,
    #[serde(alias = "i16")]
    Int16,
    #[serde(alias = "u32")]
    Uint32,
    #[serde(alias = "i32")]
    Int32,
    #[serde(alias = "f32", alias = "float 32")]
    #[strum(to_string = "float32", serialize = "float 32")]
    Float32,
}

impl DataType {
    // Short aliases for the nicely tabulated `for_each_tag` definition below.
    pub const U16: Self = Self::Uint16;
    pub const I16: Self = Self::Int16;
    pub const U32: Self = Self::Uint32;
    pub const I32: Self = Self::Int32;
    pub const F32: Self = Self::Float32;

    /// Number of 16-bit registers a value of this type occupies.
    pub const fn register_count(&self) -> u16 {
        match self {
            Self::Uint16 | Self::Int16 => 1,
            Self::Uint32 | Self::Int32 | Self::Float32 => 2,
        }
    }

    pub const fn is_integer(&self) -> bool {
        !matches!(self, Self::Float32)
    }

    /// Decode the leading registers of `words` as a value of this type.
    ///
    /// Returns `None` if there aren't enough registers.
    pub fn from_words(self, words: &[u16]) -> Option<Value> {
        let words = words.get(..usize::from(self.register_count()))?;
        let wide = || (u32::from(words[0]) << 16) | u32::from(words[1]);
        Some(match self {
            Self::Uint16 => Value::U16(words[0]),
            Self::Int16 => Value::I16(words[0] as i16),
            Self::Uint32 => Value::U32(wide()),
            Self::Int32 => Value::I32(wide() as i32),
            Self::Float32 => Value::F32(f32::from_bits(wide())),
        })
    }

    /// Convert a plain number into a value of this type.
    ///
    /// Fails if the number is not finite, has a fractional part for an integer type, or does
    /// not fit the type's range.
    pub fn value_from_f64(self, number: f64) -> Result<Value, ValueError> {
        if !number.is_finite() {
            return Err(ValueError::NotFinite(number));
        }
        if self.is_integer() && number.fract() != 0.0 {
            return Err(ValueError::NotWhole(number, self));
        }
        let out_of_range = || ValueError::OutOfRange(number, self);
        Ok(match self {
            Self::Uint16 => {
                let number = checked_cast(number, 0.0, f64::from(u16::MAX));
                Value::U16(number.ok_or_else(out_of_range)? as u16)
            }
            Self::Int16 => {
                let number = checked_cast(number, f64::from(i16::MIN), f64::from(i16::MAX));
                Value::I16(number.ok_or_else(out_of_range)? as i16)
            }
            Self::Uint32 => {
                let number = checked_cast(number, 0.0, f64::from(u32::MAX));
                Value::U32(number.ok_or_else(out_of_range)? as u32)
            }
            Self::Int32 => {
                let number = checked_cast(number, f64::from(i32::MIN), f64::from(i32::MAX));
                Value::I32(number.ok_or_else(out_of_range)? as i32)
            }
            Self::Float32 => {
                if number.abs() > f64::from(f32::MAX) {
                    return Err(out_of_range());
                }
                Value::F32(number as f32)
            }
        })
    }
}

fn checked_cast(number: f64, min: f64, max: f64) -> Option<f64> {
    (min..=max).contains(&number).then_some(number)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("{0} is not a finite number")]
    NotFinite(f64),
    #[error("{1} requires a whole number, got {0}")]
    NotWhole(f64, DataType),
    #[error("{0} does not fit into {1}")]
    OutOfRange(f64, DataType),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::U16(_) => DataType::Uint16,
            Value::I16(_) => DataType::Int16,
            Value::U32(_) => DataType::Uint32,
            Value::I32(_) => DataType::Int32,
            Value::F32(_) => DataType::Float32,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Value::U16(n) => f64::from(n),
            Value::I16(n) => f64::from(n),
            Value::U32(n) => f64::from(n),
            Value::I32(n) => f64::from(n),
            Value::F32(n) => f64::from(n),
        }
    }

    /// Encode into big-endian registers.
    pub fn to_words(&self) -> Vec<u16> {
        let split = |v: u32| vec![(v >> 16) as u16, v as u16];
        match *self {
            Value::U16(n) => vec![n],
            Value::I16(n) => vec![n as u16],
            Value::U32(n) => split(n),
            Value::I32(n) => split(n as u32),
            Value::F32(n) => split(n.to_bits()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::U16(n) => f.write_fmt(format_args!("{}", n)),
            Value::I16(n) => f.write_fmt(format_args!("{}", n)),
            Value::U32(n) => f.write_fmt(format_args!("{}", n)),
            Value::I32(n) => f.write_fmt(format_args!("{}", n)),
            Value::F32(n) => f.write_fmt(format_args!("{}", n)),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Value::U16(n) => serializer.serialize_u16(n),
            Value::I16(n) => serializer.serialize_i16(n),
            Value::U32(n) => serializer.serialize_u32(n),
            Value::I32(n) => serializer.serialize_i32(n),
            Value::F32(n) => serializer.serialize_f32(n),
        }
    }
}

/// The four Modbus data tables.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    #[default]
    HoldingRegister,
}

impl RegisterKind {
    /// Coils and discrete inputs hold single bits rather than 16-bit words.
    pub const fn is_bit(&self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub const fn is_writable(&self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "PascalCase")]
pub enum PointType {
    Digital,
    #[default]
    Analog,
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    const R_: Self = Self::R;

    pub const fn is_writable(&self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

/// A tag in the built-in Reactor 04 catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TagIndex(usize);

impl TagIndex {
    pub fn from_address(address: u16) -> Option<TagIndex> {
        let index = ADDRESSES.partition_point(|v| *v < address);
        (ADDRESSES.get(index) == Some(&address)).then_some(Self(index))
    }

    pub fn from_name(name: &str) -> Option<TagIndex> {
        let index = NAMES.iter().position(|v| v.eq_ignore_ascii_case(name));
        index.map(Self)
    }

    pub fn all() -> impl Iterator<Item = TagIndex> {
        (0..ADDRESSES.len()).map(Self)
    }

    pub fn address(&self) -> u16 {
        ADDRESSES[self.0]
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn data_type(&self) -> DataType {
        DATA_TYPES[self.0]
    }

    pub fn mode(&self) -> Mode {
        MODES[self.0]
    }

    pub fn point_type(&self) -> PointType {
        POINT_TYPES[self.0]
    }

    pub fn unit(&self) -> Option<&'static str> {
        UNITS[self.0]
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTIONS[self.0]
    }
}

// Addresses are the 1-based data model addresses the reactor PLC documentation uses; every tag
// is declared as a 32-bit float occupying two holding registers, including digital points,
// which read back as 0.0 or 1.0.
macro_rules! for_each_tag {
    ($m:ident) => {
        $m! {
            6447: F32, RW, Digital, "FBV_R4";
            6507: F32, RW, Digital, "XV_HWS_R4";
            6513: F32, RW, Digital, "XV_HWR_R4";
            6555: F32, RW, Digital, "XV_CWS_R4";
            6561: F32, RW, Digital, "XV_CWR_R4";
            6603: F32, RW, Digital, "XV_CHWS_R4";
            6609: F32, RW, Digital, "XV_CHWR_R4";
            6611: F32, RW, Digital, "XV_SLURRY_OL_R1";
            6627: F32, RW, Digital, "XV_SLURRY_OL_R2";
            6639: F32, RW, Digital, "XV_SLURRY_OL_R3";
            6651: F32, RW, Digital, "XV_SLURRY_OL_R4";
            6657: F32, RW, Digital, "XV_ER_DRAIN_R4";
            6751: F32, RW, Analog, "AG_SP_R4", unit = "%";
            6767: F32, RW, Digital, "FCV_JACKET_SWITCH_ON_R4";
            7451: F32, RW, Analog, "FCV_JACKET_SP_R4", unit = "%";
            8321: F32, R_, Digital, "AG_TRIP_FEEDBACK_R4";
            8377: F32, R_, Digital, "XV_HWS_R4_FEEDBACK_OPEN";
            8379: F32, R_, Digital, "XV_HWS_R4_FEEDBACK_CLOSE";
            8381: F32, R_, Digital, "XV_HWR_R4_FEEDBACK_OPEN";
            8383: F32, R_, Digital, "XV_HWR_R4_FEEDBACK_CLOSE";
            8409: F32, R_, Digital, "XV_CWS_R4_FEEDBACK_OPEN";
            8411: F32, R_, Digital, "XV_CWS_R4_FEEDBACK_CLOSE";
            8413: F32, R_, Digital, "XV_CWR_R4_FEEDBACK_OPEN";
            8415: F32, R_, Digital, "XV_CWR_R4_FEEDBACK_CLOSE";
            8441: F32, R_, Digital, "XV_CHWS_R4_FEEDBACK_OPEN";
            8443: F32, R_, Digital, "XV_CHWS_R4_FEEDBACK_CLOSE";
            8445: F32, R_, Digital, "XV_CHWR_R4_FEEDBACK_OPEN";
            8447: F32, R_, Digital, "XV_CHWR_R4_FEEDBACK_CLOSE";
            8619: F32, R_, Digital, "AG_IS_ON_R4";
            8789: F32, R_, Analog, "PT_R4", unit = "bar";
            8835: F32, R_, Analog, "TE_MASS_UPPER_R4", unit = "°C";
            8837: F32, R_, Analog, "TE_MASS_LOWER_R4", unit = "°C";
            8841: F32, R_, Analog, "TE_JACKET_OUT_R4", unit = "°C";
            8845: F32, R_, Analog, "TE_HW_IN_R4", unit = "°C";
            8847: F32, R_, Analog, "TE_HW_OUT_R4", unit = "°C";
            8873: F32, R_, Analog, "TE_CW_IN_R4", unit = "°C";
            8875: F32, R_, Analog, "TE_CW_OUT_R4", unit = "°C";
            8877: F32, R_, Analog, "TE_CHW_IN_R4", unit = "°C";
            8879: F32, R_, Analog, "TE_CHW_OUT_R4", unit = "°C";
            8885: F32, R_, Analog, "LT_R4", unit = "%";
            8893: F32, R_, Analog, "TE_JACKET_IN_R4", unit = "°C";
            8921: F32, R_, Analog, "AG_RPM_R4", unit = "rpm";
            8925: F32, R_, Analog, "FLOW_METER_JACKET_R4", unit = "m³/h";
            8927: F32, R_, Analog, "AG_AMP_R4", unit = "A";
            60529: F32, RW, Digital, "AG_SWITCH_ON_R4";
        }
    };
}

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

macro_rules! make_lists {
    ($($address: literal: $dt: ident, $mode: ident, $point: ident, $name: literal $(, unit = $unit: literal)?;)+) => {
        pub static ADDRESSES: &[u16] = &[$($address),*];
        pub static NAMES: &[&str] = &[$($name),*];
        pub static MODES: &[Mode] = &[$(Mode::$mode),*];
        pub static DATA_TYPES: &[DataType] = &[$(DataType::$dt),*];
        pub static POINT_TYPES: &[PointType] = &[$(PointType::$point),*];
        pub static UNITS: &[Option<&str>] = &[$(optional!($($unit)?)),*];
    };
}

for_each_tag!(make_lists);

pub static DESCRIPTIONS: &[&str] = &const {
    let mut result = [""; ADDRESSES.len()];
    let mut index = 0;
    let mut previous_address = 0;
    while index < result.len() {
        let address = ADDRESSES[index];
        if address <= previous_address {
            panic!("ADDRESSES is not sorted (or has duplicate values)!");
        }
        previous_address = address;
        result[index] = match address {
            6447 => "Bottom flush valve command",
            6507 => "Hot water supply valve command",
            6513 => "Hot water return valve command",
            6555 => "Cooling water supply valve command",
            6561 => "Cooling water return valve command",
            6603 => "Chilled water supply valve command",
            6609 => "Chilled water return valve command",
            6611 | 6627 | 6639 | 6651 => "Slurry outlet valve command, shared drain header",
            6657 => "Emergency drain valve command",
            6751 => "Agitator speed setpoint",
            6767 => "Jacket flow control valve enable",
            7451 => "Jacket flow control valve opening setpoint",
            8321 => "Agitator drive trip feedback",
            8377 | 8381 | 8409 | 8413 | 8441 | 8445 => "Valve open limit switch feedback",
            8379 | 8383 | 8411 | 8415 | 8443 | 8447 => "Valve closed limit switch feedback",
            8619 => "Agitator running feedback",
            8789 => "Reactor pressure",
            8835 => "Reaction mass temperature, upper sensor",
            8837 => "Reaction mass temperature, lower sensor",
            8841 => "Jacket outlet temperature",
            8845 => "Hot water inlet temperature",
            8847 => "Hot water outlet temperature",
            8873 => "Cooling water inlet temperature",
            8875 => "Cooling water outlet temperature",
            8877 => "Chilled water inlet temperature",
            8879 => "Chilled water outlet temperature",
            8885 => "Reactor level",
            8893 => "Jacket inlet temperature",
            8921 => "Agitator speed feedback",
            8925 => "Jacket flow",
            8927 => "Agitator motor current",
            60529 => "Agitator drive start command",
            _ => "",
        };
        index += 1;
    }
    result
};
