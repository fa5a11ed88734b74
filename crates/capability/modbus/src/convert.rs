//! 资源值与寄存器字节之间的转换。
//!
//! 序列化前先标定：`raw = (value − offset) / scale`，`scale == 0` 按 1 处理；
//! 反序列化取逆：`value = raw · scale + offset`。多字寄存器按类型自然宽度
//! 输出为连续字节串，只支持 ABCD（大端）与 DCBA（小端），不做字交换变体。

use domain::{ResourceValue, ValueType};

/// 多字节序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// ABCD：高字节在前。
    #[default]
    Big,
    /// DCBA：低字节在前。
    Little,
}

/// 转换错误。
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("cannot convert {value:?} to {value_type}")]
    Unrepresentable {
        value_type: ValueType,
        value: String,
    },
    #[error("insufficient data for {0}: {1} bytes")]
    ShortBuffer(ValueType, usize),
}

/// 类型感知的寄存器转换器。
#[derive(Debug, Clone, Copy)]
pub struct ValueConverter {
    order: ByteOrder,
}

impl ValueConverter {
    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// 把缓存值按声明类型序列化为寄存器字节。
    ///
    /// 布尔序列化为单字 0xFF00/0x0000；整数在标定后截断。
    pub fn to_registers(
        &self,
        value: &ResourceValue,
        value_type: ValueType,
        scale: f64,
        offset: f64,
    ) -> Result<Vec<u8>, ConvertError> {
        if value_type == ValueType::Bool {
            return Ok(if value.truthy() {
                vec![0xFF, 0x00]
            } else {
                vec![0x00, 0x00]
            });
        }

        let scale = if scale == 0.0 { 1.0 } else { scale };
        let raw = value
            .as_f64()
            .map(|v| (v - offset) / scale)
            .ok_or_else(|| ConvertError::Unrepresentable {
                value_type,
                value: value.to_string(),
            })?;

        Ok(match value_type {
            // bool 已在上面返回；数值兜底按 uint16 处理。
            ValueType::Bool => self.put_u16(raw as u16),
            ValueType::Int16 => self.put_u16(raw as i16 as u16),
            ValueType::Uint16 => self.put_u16(raw as u16),
            ValueType::Int32 => self.put_u32(raw as i32 as u32),
            ValueType::Uint32 => self.put_u32(raw as u32),
            ValueType::Float32 => self.put_u32((raw as f32).to_bits()),
            ValueType::Int64 => self.put_u64(raw as i64 as u64),
            ValueType::Uint64 => self.put_u64(raw as u64),
            ValueType::Float64 => self.put_u64(raw.to_bits()),
        })
    }

    /// 从寄存器字节还原值并套用逆标定。
    pub fn from_bytes(
        &self,
        data: &[u8],
        value_type: ValueType,
        scale: f64,
        offset: f64,
    ) -> Result<ResourceValue, ConvertError> {
        let width = value_type.register_count() as usize * 2;
        if data.len() < width {
            return Err(ConvertError::ShortBuffer(value_type, data.len()));
        }
        if value_type == ValueType::Bool {
            return Ok(ResourceValue::Bool(data[0] != 0 || data[1] != 0));
        }

        let raw = match value_type {
            ValueType::Bool => 0.0,
            ValueType::Int16 => self.get_u16(data) as i16 as f64,
            ValueType::Uint16 => self.get_u16(data) as f64,
            ValueType::Int32 => self.get_u32(data) as i32 as f64,
            ValueType::Uint32 => self.get_u32(data) as f64,
            ValueType::Float32 => f32::from_bits(self.get_u32(data)) as f64,
            ValueType::Int64 => self.get_u64(data) as i64 as f64,
            ValueType::Uint64 => self.get_u64(data) as f64,
            ValueType::Float64 => f64::from_bits(self.get_u64(data)),
        };

        let scale = if scale == 0.0 { 1.0 } else { scale };
        Ok(ResourceValue::F64(raw * scale + offset))
    }

    fn put_u16(&self, value: u16) -> Vec<u8> {
        match self.order {
            ByteOrder::Big => value.to_be_bytes().to_vec(),
            ByteOrder::Little => value.to_le_bytes().to_vec(),
        }
    }

    fn put_u32(&self, value: u32) -> Vec<u8> {
        match self.order {
            ByteOrder::Big => value.to_be_bytes().to_vec(),
            ByteOrder::Little => value.to_le_bytes().to_vec(),
        }
    }

    fn put_u64(&self, value: u64) -> Vec<u8> {
        match self.order {
            ByteOrder::Big => value.to_be_bytes().to_vec(),
            ByteOrder::Little => value.to_le_bytes().to_vec(),
        }
    }

    fn get_u16(&self, data: &[u8]) -> u16 {
        match self.order {
            ByteOrder::Big => u16::from_be_bytes([data[0], data[1]]),
            ByteOrder::Little => u16::from_le_bytes([data[0], data[1]]),
        }
    }

    fn get_u32(&self, data: &[u8]) -> u32 {
        match self.order {
            ByteOrder::Big => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            ByteOrder::Little => u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        }
    }

    fn get_u64(&self, data: &[u8]) -> u64 {
        let bytes = [
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ];
        match self.order {
            ByteOrder::Big => u64::from_be_bytes(bytes),
            ByteOrder::Little => u64::from_le_bytes(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big() -> ValueConverter {
        ValueConverter::new(ByteOrder::Big)
    }

    fn little() -> ValueConverter {
        ValueConverter::new(ByteOrder::Little)
    }

    #[test]
    fn float32_big_endian_bytes() {
        let bytes = big()
            .to_registers(&ResourceValue::F64(25.5), ValueType::Float32, 1.0, 0.0)
            .expect("convert");
        assert_eq!(bytes, vec![0x41, 0xCC, 0x00, 0x00]);
    }

    #[test]
    fn uint16_scaling_divides_before_serialisation() {
        let bytes = big()
            .to_registers(&ResourceValue::U64(100), ValueType::Uint16, 10.0, 0.0)
            .expect("convert");
        assert_eq!(bytes, vec![0x00, 0x0A]);
    }

    #[test]
    fn zero_scale_is_treated_as_one() {
        let bytes = big()
            .to_registers(&ResourceValue::I64(7), ValueType::Uint16, 0.0, 0.0)
            .expect("convert");
        assert_eq!(bytes, vec![0x00, 0x07]);
    }

    #[test]
    fn offset_is_subtracted_before_scaling() {
        // raw = (30 - 10) / 2 = 10
        let bytes = big()
            .to_registers(&ResourceValue::F64(30.0), ValueType::Uint16, 2.0, 10.0)
            .expect("convert");
        assert_eq!(bytes, vec![0x00, 0x0A]);
    }

    #[test]
    fn bool_serialises_to_coil_words() {
        let on = big()
            .to_registers(&ResourceValue::Bool(true), ValueType::Bool, 1.0, 0.0)
            .expect("convert");
        let off = big()
            .to_registers(&ResourceValue::Bool(false), ValueType::Bool, 1.0, 0.0)
            .expect("convert");
        assert_eq!(on, vec![0xFF, 0x00]);
        assert_eq!(off, vec![0x00, 0x00]);
    }

    #[test]
    fn negative_int16_uses_two_complement() {
        let bytes = big()
            .to_registers(&ResourceValue::I64(-100), ValueType::Int16, 1.0, 0.0)
            .expect("convert");
        assert_eq!(bytes, vec![0xFF, 0x9C]);
    }

    #[test]
    fn little_endian_reverses_bytes() {
        let bytes = little()
            .to_registers(&ResourceValue::U64(0x1234), ValueType::Uint16, 1.0, 0.0)
            .expect("convert");
        assert_eq!(bytes, vec![0x34, 0x12]);

        let wide = little()
            .to_registers(&ResourceValue::U64(0x12345678), ValueType::Uint32, 1.0, 0.0)
            .expect("convert");
        assert_eq!(wide, vec![0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn text_that_is_not_numeric_fails() {
        let err = big()
            .to_registers(
                &ResourceValue::Text("abc".to_string()),
                ValueType::Uint16,
                1.0,
                0.0,
            )
            .expect_err("should fail");
        assert!(matches!(err, ConvertError::Unrepresentable { .. }));
    }

    #[test]
    fn round_trip_recovers_value_within_precision() {
        let cases: Vec<(ValueType, f64, f64, f64)> = vec![
            (ValueType::Int16, -123.0, 1.0, 0.0),
            (ValueType::Uint16, 100.0, 10.0, 0.0),
            (ValueType::Int32, -70000.0, 1.0, 0.0),
            (ValueType::Uint32, 70000.0, 2.0, 5.0),
            (ValueType::Float32, 25.5, 1.0, 0.0),
            (ValueType::Float64, 1234.5678, 0.5, -3.0),
            (ValueType::Int64, -1_000_000.0, 1.0, 0.0),
            (ValueType::Uint64, 1_000_000.0, 4.0, 0.0),
        ];
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let converter = ValueConverter::new(order);
            for (value_type, value, scale, offset) in &cases {
                let bytes = converter
                    .to_registers(&ResourceValue::F64(*value), *value_type, *scale, *offset)
                    .expect("serialise");
                assert_eq!(bytes.len(), value_type.register_count() as usize * 2);
                let back = converter
                    .from_bytes(&bytes, *value_type, *scale, *offset)
                    .expect("deserialise");
                let ResourceValue::F64(back) = back else {
                    panic!("numeric round trip must yield f64");
                };
                assert!(
                    (back - value).abs() < 1e-3,
                    "{value_type}: {value} != {back}"
                );
            }
        }
    }

    #[test]
    fn bool_round_trip() {
        let converter = big();
        let bytes = converter
            .to_registers(&ResourceValue::Bool(true), ValueType::Bool, 1.0, 0.0)
            .expect("serialise");
        let back = converter
            .from_bytes(&bytes, ValueType::Bool, 1.0, 0.0)
            .expect("deserialise");
        assert_eq!(back, ResourceValue::Bool(true));
    }

    #[test]
    fn from_bytes_rejects_short_buffers() {
        let err = big()
            .from_bytes(&[0x41], ValueType::Float32, 1.0, 0.0)
            .expect_err("short");
        assert!(matches!(err, ConvertError::ShortBuffer(ValueType::Float32, 1)));
    }
}
