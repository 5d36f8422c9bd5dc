//! JSON <-> JavaScript value conversions
//!
//! Request objects handed to script handlers are built from JSON, and the
//! values handlers return are converted back to JSON before the router turns
//! them into HTTP responses.
//!
//! | JSON | JavaScript |
//! |------|------------|
//! | null | null |
//! | boolean | Boolean |
//! | number | Number |
//! | string | String |
//! | array | Array |
//! | object | Object |
//!
//! `undefined` and symbols become `null`; symbol keys are skipped. Values that
//! are not representable in JSON (NaN, functions) become `null` as well.

use boa_engine::{
    js_string,
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use kestrel_common::{KestrelError, Result};
use serde_json::Value as JsonValue;

/// Converts a JSON value into a JavaScript value owned by `ctx`.
pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| KestrelError::InvalidRequest(format!("Number out of range: {}", n))),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s))),
        JsonValue::Array(items) => {
            let array = JsArray::new(ctx);
            for (i, item) in items.into_iter().enumerate() {
                let value = json_to_js_value(item, ctx)?;
                array.push(value, ctx).map_err(|e| {
                    KestrelError::JavaScriptExecution(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(array.into())
        }
        JsonValue::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                object
                    .create_data_property_or_throw(js_string!(key.clone()), value, ctx)
                    .map_err(|e| {
                        KestrelError::JavaScriptExecution(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(object.into())
        }
    }
}

/// Converts a JavaScript value into JSON.
pub fn js_value_to_json(value: JsValue, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(n) = value.as_number() {
        if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
            return Ok(JsonValue::Number((n as i64).into()));
        }
        return Ok(serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null));
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    let Some(object) = value.as_object().map(|o| o.clone()) else {
        return Ok(JsonValue::Null);
    };

    if object.is_callable() {
        return Ok(JsonValue::Null);
    }

    if object.is_array() {
        let array = JsArray::from_object(object)
            .map_err(|e| KestrelError::InvalidRequest(format!("Object is not a valid array: {}", e)))?;
        let length = array
            .length(ctx)
            .map_err(|e| KestrelError::JavaScriptExecution(format!("Failed to get array length: {}", e)))?;
        let length = usize::try_from(length)
            .map_err(|_| KestrelError::InvalidRequest("Array length overflow".into()))?;

        let mut items = Vec::with_capacity(length);
        for i in 0..length {
            let item = array.get(i, ctx).map_err(|e| {
                KestrelError::JavaScriptExecution(format!("Failed to get array element {}: {}", i, e))
            })?;
            items.push(js_value_to_json(item, ctx)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let keys = object
        .own_property_keys(ctx)
        .map_err(|e| KestrelError::JavaScriptExecution(format!("Failed to get object keys: {}", e)))?;

    let mut map = serde_json::Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let property = object.get(key.clone(), ctx).map_err(|e| {
            KestrelError::JavaScriptExecution(format!("Failed to get property '{}': {}", name, e))
        })?;
        map.insert(name, js_value_to_json(property, ctx)?);
    }
    Ok(JsonValue::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    fn eval_to_json(code: &str) -> JsonValue {
        let mut ctx = Context::default();
        let value = ctx.eval(Source::from_bytes(code)).unwrap();
        js_value_to_json(value, &mut ctx).unwrap()
    }

    #[test]
    fn test_request_object_is_visible_to_scripts() {
        let mut ctx = Context::default();
        let request = json!({
            "method": "GET",
            "path": "/hello",
            "headers": {"accept": "text/html"},
            "query": [["a", "1"]],
        });
        let value = json_to_js_value(request, &mut ctx).unwrap();
        ctx.register_global_property(
            js_string!("req"),
            value,
            boa_engine::property::Attribute::all(),
        )
        .unwrap();

        let result = ctx
            .eval(Source::from_bytes("req.method + ' ' + req.path + ' ' + req.headers.accept + ' ' + req.query[0][1]"))
            .unwrap();
        assert_eq!(result.to_string(&mut ctx).unwrap().to_std_string_escaped(), "GET /hello text/html 1");
    }

    #[test]
    fn test_handler_response_object() {
        let value = eval_to_json("({status: 201, headers: {'x-kind': 'test'}, body: 'made'})");
        assert_eq!(value, json!({"status": 201, "headers": {"x-kind": "test"}, "body": "made"}));
    }

    #[test]
    fn test_numbers_and_special_values() {
        assert_eq!(eval_to_json("42"), json!(42));
        assert_eq!(eval_to_json("1.5"), json!(1.5));
        assert_eq!(eval_to_json("NaN"), JsonValue::Null);
        assert_eq!(eval_to_json("undefined"), JsonValue::Null);
        assert_eq!(eval_to_json("(function() {})"), JsonValue::Null);
    }

    #[test]
    fn test_nested_arrays() {
        assert_eq!(eval_to_json("[1, [true, null], 'x']"), json!([1, [true, null], "x"]));
    }
}
