//! Conversion between interpreter values and namespace [`Value`]s.

use codebox_core::{TableKey, Value};
use mlua::{Lua, Table};
use std::collections::BTreeMap;

/// Nesting depth beyond which a table is treated as cyclic.
pub const MAX_DEPTH: usize = 64;

/// Build an interpreter value from a namespace value.
pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Nil => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Int(i) => mlua::Value::Integer(*i),
        Value::Float(f) => mlua::Value::Number(*f),
        Value::Str(s) => mlua::Value::String(lua.create_string(s)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (key, item) in map {
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Table(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(key_to_lua(lua, key)?, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

fn key_to_lua(lua: &Lua, key: &TableKey) -> mlua::Result<mlua::Value> {
    Ok(match key {
        TableKey::Bool(b) => mlua::Value::Boolean(*b),
        TableKey::Int(i) => mlua::Value::Integer(*i),
        TableKey::Float(f) => mlua::Value::Number(*f),
        TableKey::Str(s) => mlua::Value::String(lua.create_string(s)?),
    })
}

/// Convert an interpreter value into a namespace value.
///
/// Functions, threads and userdata have no serializable form and are
/// rejected with a short description of the offending type.
pub fn from_lua(value: &mlua::Value) -> Result<Value, String> {
    from_lua_at(value, 0)
}

fn from_lua_at(value: &mlua::Value, depth: usize) -> Result<Value, String> {
    match value {
        mlua::Value::Nil => Ok(Value::Nil),
        mlua::Value::Boolean(b) => Ok(Value::Bool(*b)),
        mlua::Value::Integer(i) => Ok(Value::Int(*i)),
        mlua::Value::Number(n) => Ok(Value::Float(*n)),
        mlua::Value::String(s) => Ok(Value::Str(String::from_utf8_lossy(&s.as_bytes()).into_owned())),
        mlua::Value::Table(t) => table_to_value(t, depth),
        other => Err(format!("values of type '{}' cannot be stored", other.type_name())),
    }
}

fn table_to_value(table: &Table, depth: usize) -> Result<Value, String> {
    if depth >= MAX_DEPTH {
        return Err(format!("table nesting exceeds {} levels (cyclic?)", MAX_DEPTH));
    }

    let mut entries = Vec::new();
    for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
        entries.push(pair.map_err(|e| e.to_string())?);
    }

    // A table whose keys are exactly 1..n is a list. The empty table is too.
    let len = table.raw_len();
    if entries.len() == len {
        let mut items = vec![Value::Nil; len];
        let mut is_sequence = true;
        for (key, item) in &entries {
            match key {
                mlua::Value::Integer(i) if *i >= 1 && (*i as usize) <= len => {
                    items[*i as usize - 1] = from_lua_at(item, depth + 1)?;
                }
                _ => {
                    is_sequence = false;
                    break;
                }
            }
        }
        if is_sequence {
            return Ok(Value::List(items));
        }
    }

    if entries.iter().all(|(key, _)| matches!(key, mlua::Value::String(_))) {
        let mut map = BTreeMap::new();
        for (key, item) in &entries {
            if let mlua::Value::String(s) = key {
                map.insert(String::from_utf8_lossy(&s.as_bytes()).into_owned(), from_lua_at(item, depth + 1)?);
            }
        }
        return Ok(Value::Map(map));
    }

    let mut typed = Vec::with_capacity(entries.len());
    for (key, item) in &entries {
        typed.push((table_key(key)?, from_lua_at(item, depth + 1)?));
    }
    typed.sort_by(|a, b| a.0.cmp_order(&b.0));
    Ok(Value::Table(typed))
}

fn table_key(key: &mlua::Value) -> Result<TableKey, String> {
    match key {
        mlua::Value::Boolean(b) => Ok(TableKey::Bool(*b)),
        mlua::Value::Integer(i) => Ok(TableKey::Int(*i)),
        mlua::Value::Number(n) => Ok(TableKey::Float(*n)),
        mlua::Value::String(s) => Ok(TableKey::Str(String::from_utf8_lossy(&s.as_bytes()).into_owned())),
        other => Err(format!("table keys of type '{}' cannot be stored", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(lua: &Lua, code: &str) -> mlua::Value {
        lua.load(code).eval().unwrap()
    }

    #[test]
    fn test_scalars() {
        let lua = Lua::new();
        assert_eq!(from_lua(&eval(&lua, "return 3")).unwrap(), Value::Int(3));
        assert_eq!(from_lua(&eval(&lua, "return 3.5")).unwrap(), Value::Float(3.5));
        assert_eq!(from_lua(&eval(&lua, "return 'hi'")).unwrap(), Value::Str("hi".into()));
        assert_eq!(from_lua(&eval(&lua, "return nil")).unwrap(), Value::Nil);
    }

    #[test]
    fn test_sequence_becomes_list() {
        let lua = Lua::new();
        let value = from_lua(&eval(&lua, "return {1, 'two', {3}}")).unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::Int(1),
                Value::Str("two".into()),
                Value::List(vec![Value::Int(3)]),
            ])
        );
        assert_eq!(from_lua(&eval(&lua, "return {}")).unwrap(), Value::List(vec![]));
    }

    #[test]
    fn test_string_keyed_table_becomes_map() {
        let lua = Lua::new();
        let value = from_lua(&eval(&lua, "return {a = 1, ['1'] = 2}")).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), Value::Int(1));
        expected.insert("1".to_string(), Value::Int(2));
        assert_eq!(value, Value::Map(expected));
    }

    #[test]
    fn test_mixed_table_keeps_integer_keys() {
        let lua = Lua::new();
        let value = from_lua(&eval(&lua, "return {10, 20, n = 2}")).unwrap();
        assert_eq!(
            value,
            Value::Table(vec![
                (TableKey::Int(1), Value::Int(10)),
                (TableKey::Int(2), Value::Int(20)),
                (TableKey::Str("n".into()), Value::Int(2)),
            ])
        );

        let back = to_lua(&lua, &value).unwrap();
        let mlua::Value::Table(t) = back else {
            panic!("expected table");
        };
        assert_eq!(t.get::<i64>(1).unwrap(), 10);
        assert_eq!(t.get::<i64>("n").unwrap(), 2);
        assert!(t.get::<Option<i64>>("1").unwrap().is_none());
    }

    #[test]
    fn test_sparse_table_keeps_integer_keys() {
        let lua = Lua::new();
        let value = from_lua(&eval(&lua, "local s = {}; s[2] = 'b'; s[5] = 'e'; return s")).unwrap();
        assert_eq!(
            value,
            Value::Table(vec![
                (TableKey::Int(2), Value::from("b")),
                (TableKey::Int(5), Value::from("e")),
            ])
        );
    }

    #[test]
    fn test_bool_and_float_keys() {
        let lua = Lua::new();
        let value = from_lua(&eval(&lua, "return {[true] = 'yes', [1.5] = 'half'}")).unwrap();
        assert_eq!(
            value,
            Value::Table(vec![
                (TableKey::Bool(true), Value::from("yes")),
                (TableKey::Float(1.5), Value::from("half")),
            ])
        );
        assert_eq!(from_lua(&to_lua(&lua, &value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_functions_rejected() {
        let lua = Lua::new();
        let err = from_lua(&eval(&lua, "return function() end")).unwrap_err();
        assert!(err.contains("function"));
    }

    #[test]
    fn test_cycle_rejected() {
        let lua = Lua::new();
        let err = from_lua(&eval(&lua, "local t = {}; t.self = t; return t")).unwrap_err();
        assert!(err.contains("cyclic"));
    }

    #[test]
    fn test_to_lua_and_back() {
        let lua = Lua::new();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::List(vec![Value::Int(1), Value::Float(2.5)]));
        let original = Value::Map(map);
        let lua_value = to_lua(&lua, &original).unwrap();
        assert_eq!(from_lua(&lua_value).unwrap(), original);
    }
}
