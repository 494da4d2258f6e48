//! Funciones que provee la aplicación: codecs, funciones de reducción y
//! conversores de colecciones. El runtime las resuelve por nombre a partir de
//! la configuración de cada operador.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Add;
use std::sync::Arc;

use crate::error::{GroupCommError, Result};
use crate::operator::{OperatorSpec, DEFAULT_CODEC, DEFAULT_DATA_CONVERTER};

/* =========================
   Codec
   ========================= */

/// Convierte valores de dominio a bytes y de vuelta.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> std::result::Result<Vec<u8>, String>;
    fn decode(&self, bytes: &[u8]) -> std::result::Result<T, String>;
}

/// Codec por defecto basado en serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> std::result::Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| format!("error serializando a JSON: {e}"))
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<T, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("error leyendo JSON: {e}"))
    }
}

/// Empaqueta una secuencia de payloads como `[len u32 BE][bytes]...`.
pub fn frame_values(parts: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = parts.iter().map(|p| p.len() + 4).sum();
    let mut out = Vec::with_capacity(total + 4);
    out.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Inverso de [`frame_values`].
pub fn unframe_values(bytes: &[u8]) -> std::result::Result<Vec<Vec<u8>>, String> {
    fn read_u32(bytes: &[u8], at: usize) -> std::result::Result<usize, String> {
        let raw = bytes
            .get(at..at + 4)
            .ok_or_else(|| format!("frame truncado en offset {at}"))?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    let count = read_u32(bytes, 0)?;
    let mut offset = 4;
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u32(bytes, offset)?;
        offset += 4;
        let part = bytes
            .get(offset..offset + len)
            .ok_or_else(|| format!("frame truncado: se esperaban {len} bytes en offset {offset}"))?;
        parts.push(part.to_vec());
        offset += len;
    }
    if offset != bytes.len() {
        return Err(format!("sobran {} bytes al final del frame", bytes.len() - offset));
    }
    Ok(parts)
}

/* =========================
   ReduceFunction
   ========================= */

/// Agregación pura `(secuencia de T) -> T`.
///
/// El runtime siempre la invoca con al menos un valor.
pub trait ReduceFunction<T>: Send + Sync {
    fn reduce(&self, values: Vec<T>) -> T;
}

impl<T, F> ReduceFunction<T> for F
where
    F: Fn(Vec<T>) -> T + Send + Sync,
{
    fn reduce(&self, values: Vec<T>) -> T {
        self(values)
    }
}

/// Suma de todos los valores.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum<T>(PhantomData<fn() -> T>);

impl<T> Sum<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> ReduceFunction<T> for Sum<T>
where
    T: Add<Output = T> + Default,
{
    fn reduce(&self, values: Vec<T>) -> T {
        values.into_iter().fold(T::default(), |acc, v| acc + v)
    }
}

/// Mínimo (requiere `Ord`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Min<T>(PhantomData<fn() -> T>);

impl<T> Min<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> ReduceFunction<T> for Min<T>
where
    T: Ord + Default,
{
    fn reduce(&self, values: Vec<T>) -> T {
        values.into_iter().min().unwrap_or_default()
    }
}

/// Máximo (requiere `Ord`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Max<T>(PhantomData<fn() -> T>);

impl<T> Max<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> ReduceFunction<T> for Max<T>
where
    T: Ord + Default,
{
    fn reduce(&self, values: Vec<T>) -> T {
        values.into_iter().max().unwrap_or_default()
    }
}

/* =========================
   DataConverter
   ========================= */

/// Parte y une colecciones para scatter/gather.
pub trait DataConverter<T>: Send + Sync {
    /// Parte `values` en a lo sumo `shares` sub-secuencias, en orden.
    fn split(&self, values: Vec<T>, shares: usize) -> Vec<Vec<T>>;
    /// Une sub-secuencias en el orden recibido.
    fn merge(&self, parts: Vec<Vec<T>>) -> Vec<T>;
}

/// Bloques contiguos; los primeros `len % shares` bloques llevan un elemento extra.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkedConverter;

impl<T> DataConverter<T> for ChunkedConverter {
    fn split(&self, values: Vec<T>, shares: usize) -> Vec<Vec<T>> {
        if shares == 0 {
            return Vec::new();
        }
        let base = values.len() / shares;
        let extra = values.len() % shares;

        let mut out = Vec::with_capacity(shares);
        let mut iter = values.into_iter();
        for i in 0..shares {
            let size = base + usize::from(i < extra);
            out.push(iter.by_ref().take(size).collect());
        }
        out
    }

    fn merge(&self, parts: Vec<Vec<T>>) -> Vec<T> {
        parts.into_iter().flatten().collect()
    }
}

/* =========================
   Registro por nombre
   ========================= */

/// Implementaciones disponibles para un tipo `T`, indexadas por nombre.
pub struct FunctionRegistry<T> {
    codecs: HashMap<String, Arc<dyn Codec<T>>>,
    reducers: HashMap<String, Arc<dyn ReduceFunction<T>>>,
    converters: HashMap<String, Arc<dyn DataConverter<T>>>,
}

/// Funciones ya resueltas para un operador concreto.
pub struct ResolvedFunctions<T> {
    pub codec: Arc<dyn Codec<T>>,
    pub reducer: Option<Arc<dyn ReduceFunction<T>>>,
    pub converter: Arc<dyn DataConverter<T>>,
}

impl<T> Clone for ResolvedFunctions<T> {
    fn clone(&self) -> Self {
        Self {
            codec: Arc::clone(&self.codec),
            reducer: self.reducer.clone(),
            converter: Arc::clone(&self.converter),
        }
    }
}

impl<T: 'static> FunctionRegistry<T> {
    /// Registro vacío, sin codec por defecto.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
            reducers: HashMap::new(),
            converters: HashMap::new(),
        }
    }

    pub fn with_codec(mut self, name: impl Into<String>, codec: impl Codec<T> + 'static) -> Self {
        self.codecs.insert(name.into(), Arc::new(codec));
        self
    }

    pub fn with_reduce_function(
        mut self,
        name: impl Into<String>,
        reducer: impl ReduceFunction<T> + 'static,
    ) -> Self {
        self.reducers.insert(name.into(), Arc::new(reducer));
        self
    }

    pub fn with_data_converter(
        mut self,
        name: impl Into<String>,
        converter: impl DataConverter<T> + 'static,
    ) -> Self {
        self.converters.insert(name.into(), Arc::new(converter));
        self
    }

    /// Resuelve las funciones que pide la configuración de `spec`.
    pub fn resolve(&self, spec: &OperatorSpec) -> Result<ResolvedFunctions<T>> {
        let missing = |kind: &'static str, name: &str| GroupCommError::MissingFunction {
            group_id: spec.group_id().to_string(),
            operator: spec.name().to_string(),
            kind,
            name: name.to_string(),
        };

        let codec = self
            .codecs
            .get(spec.codec_name())
            .cloned()
            .ok_or_else(|| missing("codec", spec.codec_name()))?;

        let converter = self
            .converters
            .get(spec.data_converter_name())
            .cloned()
            .ok_or_else(|| missing("data_converter", spec.data_converter_name()))?;

        let reducer = match spec.reduce_function_name() {
            Some(name) => Some(
                self.reducers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| missing("reduce_function", name))?,
            ),
            None => None,
        };

        Ok(ResolvedFunctions {
            codec,
            reducer,
            converter,
        })
    }
}

impl<T> FunctionRegistry<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Registro con el codec `json` y el conversor `chunked`.
    pub fn new() -> Self {
        Self::empty()
            .with_codec(DEFAULT_CODEC, JsonCodec::<T>::new())
            .with_data_converter(DEFAULT_DATA_CONVERTER, ChunkedConverter)
    }
}

impl<T> Default for FunctionRegistry<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
