//! In-memory worksheet model: head XML, row/cell map and tail XML.
//!
//! Only `<sheetData>` is modeled cell by cell. Everything before it is kept verbatim and
//! everything after it too, except for the pieces patched on serialization: `<dimension>`,
//! the first `<sheetView>` pane and `<mergeCells>`.

use std::collections::BTreeMap;
use std::io::Write;

use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::package::{
    capture_inner_xml, derive_attribute_list, derive_attribute_map, derive_element_prefix,
    derive_prefixed_tag, if_contains_element,
};
use crate::spec::{EnumCellValue, EnumXlsxExportError, SheetCellSource, SpecCellRange};
use crate::util::{
    derive_column_name, derive_excel_serial_from_datetime, parse_cell_range, parse_cell_ref,
};

/// Cell attributes replaced on every write.
const TUP_CELL_VALUE_ATTRS: [&str; 5] = ["r", "s", "t", "cm", "vm"];

#[derive(Debug, Clone, Default)]
struct SpecSheetCell {
    attrs: Vec<(String, String)>,
    inner_xml: String,
}

impl SpecSheetCell {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(c_key, _)| c_key == key)
            .map(|(_, c_value)| c_value.as_str())
    }

    fn set_attr(&mut self, key: &str, value: String) {
        match self.attrs.iter_mut().find(|(c_key, _)| c_key == key) {
            Some((_, c_value)) => *c_value = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SpecSheetRow {
    attrs: Vec<(String, String)>,
    cells: BTreeMap<u32, SpecSheetCell>,
}

impl SpecSheetRow {
    fn new(row: u32) -> Self {
        Self {
            attrs: vec![("r".to_string(), row.to_string())],
            cells: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnumParseState {
    Head,
    Rows,
    Tail,
}

/// Editable worksheet part.
pub struct XlsxSheet {
    name: String,
    part_name: String,
    prefix: Option<String>,
    xml_head: Vec<u8>,
    dict_rows: BTreeMap<u32, SpecSheetRow>,
    xml_tail: Vec<u8>,
    l_merged_ranges: Vec<SpecCellRange>,
    if_merges_changed: bool,
    freeze: Option<(u32, u32)>,
    l_shared_strings: Vec<String>,
    if_formula_overwritten: bool,
}

impl XlsxSheet {
    /// Parse a worksheet part. `shared_strings` is only used to read cell text back.
    pub fn parse(
        name: &str,
        part_name: &str,
        xml: &[u8],
        shared_strings: Vec<String>,
    ) -> Result<Self, EnumXlsxExportError> {
        let c_xml = String::from_utf8(xml.to_vec())?;
        let mut reader = Reader::from_str(&c_xml);
        reader.config_mut().trim_text(false);

        let mut w_head = Writer::new(Vec::new());
        let mut w_tail = Writer::new(Vec::new());
        let mut prefix = None;
        let mut dict_rows = BTreeMap::new();
        let mut l_merged_ranges = Vec::new();
        let mut enum_state = EnumParseState::Head;
        let mut n_row_last = 0u32;

        loop {
            let event = reader.read_event()?;
            match enum_state {
                EnumParseState::Head => match event {
                    Event::Eof => {
                        return Err(EnumXlsxExportError::InvalidPackage(format!(
                            "{part_name}: missing <sheetData>"
                        )));
                    }
                    Event::Start(ref e) if e.local_name().as_ref() == b"worksheet" => {
                        prefix = derive_element_prefix(e)?;
                        w_head.write_event(event.clone())?;
                    }
                    Event::Start(ref e) if e.local_name().as_ref() == b"sheetData" => {
                        w_head.write_event(event.clone())?;
                        enum_state = EnumParseState::Rows;
                    }
                    Event::Empty(ref e) if e.local_name().as_ref() == b"sheetData" => {
                        w_head.write_event(Event::Start(e.clone()))?;
                        w_tail.write_event(Event::End(e.to_end().into_owned()))?;
                        enum_state = EnumParseState::Tail;
                    }
                    _ => w_head.write_event(event)?,
                },
                EnumParseState::Rows => match event {
                    Event::Eof => {
                        return Err(EnumXlsxExportError::InvalidPackage(format!(
                            "{part_name}: unterminated <sheetData>"
                        )));
                    }
                    Event::Start(ref e) if e.local_name().as_ref() == b"row" => {
                        let (n_row, mut row) = parse_row_head(e, n_row_last)?;
                        parse_row_cells(&mut reader, n_row, &mut row, part_name)?;
                        n_row_last = n_row;
                        dict_rows.insert(n_row, row);
                    }
                    Event::Empty(ref e) if e.local_name().as_ref() == b"row" => {
                        let (n_row, row) = parse_row_head(e, n_row_last)?;
                        n_row_last = n_row;
                        dict_rows.insert(n_row, row);
                    }
                    Event::End(ref e) if e.local_name().as_ref() == b"sheetData" => {
                        w_tail.write_event(event.clone())?;
                        enum_state = EnumParseState::Tail;
                    }
                    _ => {}
                },
                EnumParseState::Tail => match event {
                    Event::Eof => break,
                    Event::Start(ref e) | Event::Empty(ref e)
                        if e.local_name().as_ref() == b"mergeCell" =>
                    {
                        let dict_attrs = derive_attribute_map(e)?;
                        let c_ref = dict_attrs.get("ref").map(String::as_str).unwrap_or("");
                        let range = parse_cell_range(c_ref).ok_or_else(|| {
                            EnumXlsxExportError::InvalidPackage(format!(
                                "{part_name}: bad merge ref {c_ref:?}"
                            ))
                        })?;
                        l_merged_ranges.push(range);
                        w_tail.write_event(event.clone())?;
                    }
                    _ => w_tail.write_event(event)?,
                },
            }
        }

        Ok(Self {
            name: name.to_string(),
            part_name: part_name.to_string(),
            prefix,
            xml_head: w_head.into_inner(),
            dict_rows,
            xml_tail: w_tail.into_inner(),
            l_merged_ranges,
            if_merges_changed: false,
            freeze: None,
            l_shared_strings: shared_strings,
            if_formula_overwritten: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn part_name(&self) -> &str {
        &self.part_name
    }

    pub fn merged_ranges(&self) -> &[SpecCellRange] {
        &self.l_merged_ranges
    }

    pub fn set_merged_ranges(&mut self, ranges: Vec<SpecCellRange>) {
        if ranges != self.l_merged_ranges {
            self.l_merged_ranges = ranges;
            self.if_merges_changed = true;
        }
    }

    pub fn freeze_panes(&self) -> Option<(u32, u32)> {
        self.freeze
    }

    /// Freeze rows above `row` and columns left of `col` in the first sheet view.
    pub fn set_freeze_panes(&mut self, row: u32, col: u32) {
        self.freeze = Some((row, col));
    }

    /// Whether a cell holding a formula has been overwritten.
    pub fn if_formula_overwritten(&self) -> bool {
        self.if_formula_overwritten
    }

    /// Style index of a cell, falling back to a custom row style, then to 0.
    pub fn cell_style(&self, row: u32, col: u32) -> u32 {
        let Some(sheet_row) = self.dict_rows.get(&row) else {
            return 0;
        };
        let derive_index = |c_value: Option<&str>| c_value.and_then(|c| c.parse::<u32>().ok());
        if let Some(n_style) = sheet_row
            .cells
            .get(&col)
            .and_then(|cell| derive_index(cell.attr("s")))
        {
            return n_style;
        }
        let if_custom_row = sheet_row
            .attrs
            .iter()
            .any(|(c_key, c_value)| c_key == "customFormat" && (c_value == "1" || c_value == "true"));
        if if_custom_row {
            let c_row_style = sheet_row
                .attrs
                .iter()
                .find(|(c_key, _)| c_key == "s")
                .map(|(_, c_value)| c_value.as_str());
            return derive_index(c_row_style).unwrap_or(0);
        }
        0
    }

    pub fn set_cell_style(&mut self, row: u32, col: u32, style: u32) {
        let cell = self.ensure_cell(row, col);
        cell.set_attr("s", style.to_string());
    }

    /// Replace a cell's value, keeping its style unless `style` overrides it.
    ///
    /// Text is written as an inline string; blank values leave a value-less cell.
    pub fn set_cell_value(
        &mut self,
        row: u32,
        col: u32,
        value: &EnumCellValue,
        style: Option<u32>,
    ) {
        let c_tag_is = derive_prefixed_tag(self.prefix.as_deref(), "is");
        let c_tag_t = derive_prefixed_tag(self.prefix.as_deref(), "t");
        let c_tag_v = derive_prefixed_tag(self.prefix.as_deref(), "v");

        let (c_type, c_inner) = match value {
            EnumCellValue::None => (None, String::new()),
            EnumCellValue::String(c_text) if c_text.is_empty() => (None, String::new()),
            EnumCellValue::String(c_text) => (
                Some("inlineStr"),
                derive_inline_string_xml(&c_tag_is, &c_tag_t, c_text),
            ),
            EnumCellValue::Number(n_value) if n_value.is_finite() => {
                (None, format!("<{c_tag_v}>{n_value}</{c_tag_v}>"))
            }
            EnumCellValue::DateTime(dt_value) => match derive_excel_serial_from_datetime(dt_value)
            {
                Some(n_serial) => (None, format!("<{c_tag_v}>{n_serial}</{c_tag_v}>")),
                None => (
                    Some("inlineStr"),
                    derive_inline_string_xml(&c_tag_is, &c_tag_t, &value.to_text()),
                ),
            },
            EnumCellValue::Number(_) => (
                Some("inlineStr"),
                derive_inline_string_xml(&c_tag_is, &c_tag_t, &value.to_text()),
            ),
        };

        let cell = self.ensure_cell(row, col);
        let if_formula = if_contains_element(&cell.inner_xml, b"f");
        let shared_master = derive_shared_formula_master(&cell.inner_xml);
        let c_style = style
            .map(|n_style| n_style.to_string())
            .or_else(|| cell.attr("s").map(str::to_string));

        let mut l_attrs = vec![("r".to_string(), format!("{}{}", derive_column_name(col), row))];
        if let Some(c_style) = c_style {
            l_attrs.push(("s".to_string(), c_style));
        }
        if let Some(c_type) = c_type {
            l_attrs.push(("t".to_string(), c_type.to_string()));
        }
        l_attrs.extend(
            cell.attrs
                .iter()
                .filter(|(c_key, _)| !TUP_CELL_VALUE_ATTRS.contains(&c_key.as_str()))
                .cloned(),
        );
        cell.attrs = l_attrs;
        cell.inner_xml = c_inner;

        if if_formula {
            self.if_formula_overwritten = true;
        }
        if let Some((c_si, range)) = shared_master {
            self.detach_shared_formula(&c_si, &range);
        }
    }

    /// Freeze the dependents of a removed shared-formula master to their cached values.
    ///
    /// Dependents only carry `<f t="shared" si=N/>` and are invalid once the master is gone.
    fn detach_shared_formula(&mut self, si: &str, range: &SpecCellRange) {
        let c_tag_is = derive_prefixed_tag(self.prefix.as_deref(), "is");
        let c_tag_t = derive_prefixed_tag(self.prefix.as_deref(), "t");
        let c_tag_v = derive_prefixed_tag(self.prefix.as_deref(), "v");

        let mut n_detached = 0usize;
        for sheet_row in self
            .dict_rows
            .range_mut(range.row_first..=range.row_last)
            .map(|(_, sheet_row)| sheet_row)
        {
            for cell in sheet_row
                .cells
                .range_mut(range.col_first..=range.col_last)
                .map(|(_, cell)| cell)
            {
                let Some(l_attrs) = derive_formula_attributes(&cell.inner_xml) else {
                    continue;
                };
                let derive_attr = |key: &str| {
                    l_attrs
                        .iter()
                        .find(|(c_key, _)| c_key == key)
                        .map(|(_, c_value)| c_value.as_str())
                };
                if derive_attr("t") != Some("shared") || derive_attr("si") != Some(si) {
                    continue;
                }

                let c_cached = derive_cached_value(&cell.inner_xml).filter(|c| !c.is_empty());
                let if_text = cell.attr("t") == Some("str");
                match c_cached {
                    Some(c_value) if if_text => {
                        cell.set_attr("t", "inlineStr".to_string());
                        cell.inner_xml = derive_inline_string_xml(&c_tag_is, &c_tag_t, &c_value);
                    }
                    Some(c_value) => {
                        cell.inner_xml =
                            format!("<{c_tag_v}>{}</{c_tag_v}>", escape(c_value.as_str()));
                    }
                    None => {
                        cell.attrs.retain(|(c_key, _)| c_key != "t");
                        cell.inner_xml.clear();
                    }
                }
                n_detached += 1;
            }
        }
        if n_detached > 0 {
            self.if_formula_overwritten = true;
            tracing::debug!(
                sheet = %self.name,
                si,
                cells = n_detached,
                "shared formula dependents replaced by cached values"
            );
        }
    }

    fn ensure_cell(&mut self, row: u32, col: u32) -> &mut SpecSheetCell {
        let sheet_row = self
            .dict_rows
            .entry(row)
            .or_insert_with(|| SpecSheetRow::new(row));
        sheet_row.attrs.retain(|(c_key, _)| c_key != "spans");
        sheet_row.cells.entry(col).or_insert_with(|| SpecSheetCell {
            attrs: vec![("r".to_string(), format!("{}{}", derive_column_name(col), row))],
            ..Default::default()
        })
    }

    fn derive_dimension_ref(&self) -> String {
        let mut range: Option<SpecCellRange> = None;
        for (n_row, sheet_row) in &self.dict_rows {
            let (Some(n_col_first), Some(n_col_last)) =
                (sheet_row.cells.keys().next(), sheet_row.cells.keys().next_back())
            else {
                continue;
            };
            range = Some(match range {
                None => SpecCellRange {
                    row_first: *n_row,
                    col_first: *n_col_first,
                    row_last: *n_row,
                    col_last: *n_col_last,
                },
                Some(range) => SpecCellRange {
                    row_first: range.row_first.min(*n_row),
                    col_first: range.col_first.min(*n_col_first),
                    row_last: range.row_last.max(*n_row),
                    col_last: range.col_last.max(*n_col_last),
                },
            });
        }
        range.map_or_else(|| "A1".to_string(), |range| range.to_string())
    }

    /// Serialize the worksheet part.
    pub fn to_xml(&self) -> Result<Vec<u8>, EnumXlsxExportError> {
        let mut v_xml = Vec::with_capacity(self.xml_head.len() + self.xml_tail.len());
        v_xml.extend_from_slice(&self.xml_head);
        v_xml.extend_from_slice(&self.write_rows_xml()?);
        v_xml.extend_from_slice(&self.xml_tail);
        self.patch_sheet_xml(&v_xml)
    }

    fn write_rows_xml(&self) -> Result<Vec<u8>, EnumXlsxExportError> {
        let c_tag_row = derive_prefixed_tag(self.prefix.as_deref(), "row");
        let c_tag_c = derive_prefixed_tag(self.prefix.as_deref(), "c");
        let mut writer = Writer::new(Vec::new());

        for sheet_row in self.dict_rows.values() {
            let mut e_row = BytesStart::new(c_tag_row.as_str());
            for (c_key, c_value) in &sheet_row.attrs {
                e_row.push_attribute((c_key.as_str(), c_value.as_str()));
            }
            if sheet_row.cells.is_empty() {
                writer.write_event(Event::Empty(e_row))?;
                continue;
            }
            writer.write_event(Event::Start(e_row))?;
            for cell in sheet_row.cells.values() {
                let mut e_cell = BytesStart::new(c_tag_c.as_str());
                for (c_key, c_value) in &cell.attrs {
                    e_cell.push_attribute((c_key.as_str(), c_value.as_str()));
                }
                if cell.inner_xml.is_empty() {
                    writer.write_event(Event::Empty(e_cell))?;
                } else {
                    writer.write_event(Event::Start(e_cell))?;
                    writer.get_mut().write_all(cell.inner_xml.as_bytes())?;
                    writer.write_event(Event::End(BytesEnd::new(c_tag_c.as_str())))?;
                }
            }
            writer.write_event(Event::End(BytesEnd::new(c_tag_row.as_str())))?;
        }
        Ok(writer.into_inner())
    }

    /// Rewrite `<dimension>`, the frozen pane and `<mergeCells>` in one streaming pass.
    fn patch_sheet_xml(&self, xml: &[u8]) -> Result<Vec<u8>, EnumXlsxExportError> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(xml.len()));
        let mut buf = Vec::new();

        let mut n_skip_depth = 0usize;
        let mut n_view_depth = 0usize;
        let mut if_views_done = self.freeze.is_none();

        loop {
            let event = reader.read_event_into(&mut buf)?;
            if n_skip_depth > 0 {
                match event {
                    Event::Start(_) => n_skip_depth += 1,
                    Event::End(_) => n_skip_depth -= 1,
                    Event::Eof => break,
                    _ => {}
                }
                buf.clear();
                continue;
            }

            let if_start = matches!(event, Event::Start(_));
            match event {
                Event::Eof => break,
                Event::Start(ref e) | Event::Empty(ref e)
                    if e.local_name().as_ref() == b"dimension" =>
                {
                    let c_ref = self.derive_dimension_ref();
                    let mut e_dim = BytesStart::new(
                        String::from_utf8(e.name().as_ref().to_vec())?,
                    );
                    e_dim.push_attribute(("ref", c_ref.as_str()));
                    writer.write_event(Event::Empty(e_dim))?;
                    if if_start {
                        n_skip_depth = 1;
                    }
                }
                Event::Start(ref e) | Event::Empty(ref e)
                    if self.if_merges_changed && e.local_name().as_ref() == b"mergeCells" =>
                {
                    self.write_merge_cells(&mut writer)?;
                    if if_start {
                        n_skip_depth = 1;
                    }
                }
                Event::Start(ref e) | Event::Empty(ref e)
                    if !if_views_done && e.local_name().as_ref() == b"sheetViews" =>
                {
                    if if_start {
                        writer.write_event(event.clone())?;
                    } else {
                        self.write_sheet_views(&mut writer)?;
                        if_views_done = true;
                    }
                }
                Event::Start(ref e) if !if_views_done && e.local_name().as_ref() == b"sheetView" => {
                    writer.write_event(event.clone())?;
                    self.write_freeze_pane(&mut writer)?;
                    if_views_done = true;
                    n_view_depth = 1;
                }
                Event::Empty(ref e) if !if_views_done && e.local_name().as_ref() == b"sheetView" => {
                    writer.write_event(Event::Start(e.clone()))?;
                    self.write_freeze_pane(&mut writer)?;
                    writer.write_event(Event::End(e.to_end().into_owned()))?;
                    if_views_done = true;
                }
                Event::Start(ref e) | Event::Empty(ref e)
                    if !if_views_done
                        && matches!(
                            e.local_name().as_ref(),
                            b"sheetFormatPr" | b"cols" | b"sheetData"
                        ) =>
                {
                    self.write_sheet_views(&mut writer)?;
                    if_views_done = true;
                    writer.write_event(event.clone())?;
                }
                Event::Start(ref e) | Event::Empty(ref e)
                    if n_view_depth == 1
                        && matches!(e.local_name().as_ref(), b"pane" | b"selection") =>
                {
                    if if_start {
                        n_skip_depth = 1;
                    }
                }
                Event::Start(_) if n_view_depth > 0 => {
                    n_view_depth += 1;
                    writer.write_event(event)?;
                }
                Event::End(_) if n_view_depth > 0 => {
                    n_view_depth -= 1;
                    writer.write_event(event)?;
                }
                _ => writer.write_event(event)?,
            }
            buf.clear();
        }
        Ok(writer.into_inner())
    }

    fn write_merge_cells(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), EnumXlsxExportError> {
        if self.l_merged_ranges.is_empty() {
            return Ok(());
        }
        let c_tag = derive_prefixed_tag(self.prefix.as_deref(), "mergeCells");
        let c_tag_item = derive_prefixed_tag(self.prefix.as_deref(), "mergeCell");
        let c_count = self.l_merged_ranges.len().to_string();

        let mut e_merge_cells = BytesStart::new(c_tag.as_str());
        e_merge_cells.push_attribute(("count", c_count.as_str()));
        writer.write_event(Event::Start(e_merge_cells))?;
        for range in &self.l_merged_ranges {
            let c_ref = range.to_string();
            let mut e_item = BytesStart::new(c_tag_item.as_str());
            e_item.push_attribute(("ref", c_ref.as_str()));
            writer.write_event(Event::Empty(e_item))?;
        }
        writer.write_event(Event::End(BytesEnd::new(c_tag.as_str())))?;
        Ok(())
    }

    fn write_sheet_views(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), EnumXlsxExportError> {
        let c_tag_views = derive_prefixed_tag(self.prefix.as_deref(), "sheetViews");
        let c_tag_view = derive_prefixed_tag(self.prefix.as_deref(), "sheetView");
        writer.write_event(Event::Start(BytesStart::new(c_tag_views.as_str())))?;
        let mut e_view = BytesStart::new(c_tag_view.as_str());
        e_view.push_attribute(("workbookViewId", "0"));
        writer.write_event(Event::Start(e_view))?;
        self.write_freeze_pane(writer)?;
        writer.write_event(Event::End(BytesEnd::new(c_tag_view.as_str())))?;
        writer.write_event(Event::End(BytesEnd::new(c_tag_views.as_str())))?;
        Ok(())
    }

    fn write_freeze_pane(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), EnumXlsxExportError> {
        let Some((n_row, n_col)) = self.freeze else {
            return Ok(());
        };
        let n_split_x = n_col.saturating_sub(1);
        let n_split_y = n_row.saturating_sub(1);
        let c_active_pane = match (n_split_x > 0, n_split_y > 0) {
            (true, true) => "bottomRight",
            (false, true) => "bottomLeft",
            (true, false) => "topRight",
            (false, false) => return Ok(()),
        };
        let c_top_left = format!("{}{}", derive_column_name(n_col.max(1)), n_row.max(1));
        let c_split_x = n_split_x.to_string();
        let c_split_y = n_split_y.to_string();

        let mut e_pane = BytesStart::new(derive_prefixed_tag(self.prefix.as_deref(), "pane"));
        if n_split_x > 0 {
            e_pane.push_attribute(("xSplit", c_split_x.as_str()));
        }
        if n_split_y > 0 {
            e_pane.push_attribute(("ySplit", c_split_y.as_str()));
        }
        e_pane.push_attribute(("topLeftCell", c_top_left.as_str()));
        e_pane.push_attribute(("activePane", c_active_pane));
        e_pane.push_attribute(("state", "frozen"));
        writer.write_event(Event::Empty(e_pane))?;

        let mut e_selection =
            BytesStart::new(derive_prefixed_tag(self.prefix.as_deref(), "selection"));
        e_selection.push_attribute(("pane", c_active_pane));
        e_selection.push_attribute(("activeCell", c_top_left.as_str()));
        e_selection.push_attribute(("sqref", c_top_left.as_str()));
        writer.write_event(Event::Empty(e_selection))?;
        Ok(())
    }
}

impl SheetCellSource for XlsxSheet {
    fn cell_text(&self, row: u32, col: u32) -> Option<String> {
        let cell = self.dict_rows.get(&row)?.cells.get(&col)?;
        derive_cell_text(cell, &self.l_shared_strings).ok().flatten()
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region SheetXmlParsing

/// Row number and attributes; rows without `r` follow the previous row.
fn parse_row_head(
    elem: &BytesStart<'_>,
    n_row_last: u32,
) -> Result<(u32, SpecSheetRow), EnumXlsxExportError> {
    let mut l_attrs = derive_attribute_list(elem)?;
    let n_row = l_attrs
        .iter()
        .find(|(c_key, _)| c_key == "r")
        .and_then(|(_, c_value)| c_value.parse::<u32>().ok());
    let n_row = match n_row {
        Some(n_row) => n_row,
        None => {
            let n_row = n_row_last + 1;
            l_attrs.retain(|(c_key, _)| c_key != "r");
            l_attrs.insert(0, ("r".to_string(), n_row.to_string()));
            n_row
        }
    };
    Ok((
        n_row,
        SpecSheetRow {
            attrs: l_attrs,
            cells: BTreeMap::new(),
        },
    ))
}

/// Column number and attributes; cells without `r` follow the previous cell.
fn parse_cell_head(
    elem: &BytesStart<'_>,
    n_row: u32,
    n_col_last: u32,
) -> Result<(u32, Vec<(String, String)>), EnumXlsxExportError> {
    let mut l_attrs = derive_attribute_list(elem)?;
    let n_col = l_attrs
        .iter()
        .find(|(c_key, _)| c_key == "r")
        .and_then(|(_, c_value)| parse_cell_ref(c_value))
        .map(|(_, n_col)| n_col);
    let n_col = match n_col {
        Some(n_col) => n_col,
        None => {
            let n_col = n_col_last + 1;
            l_attrs.retain(|(c_key, _)| c_key != "r");
            l_attrs.insert(0, ("r".to_string(), format!("{}{}", derive_column_name(n_col), n_row)));
            n_col
        }
    };
    Ok((n_col, l_attrs))
}

fn parse_row_cells(
    reader: &mut Reader<&[u8]>,
    n_row: u32,
    sheet_row: &mut SpecSheetRow,
    part_name: &str,
) -> Result<(), EnumXlsxExportError> {
    let mut n_col_last = 0u32;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                let (n_col, l_attrs) = parse_cell_head(&e, n_row, n_col_last)?;
                let inner_xml = capture_inner_xml(reader, part_name)?;
                sheet_row.cells.insert(
                    n_col,
                    SpecSheetCell {
                        attrs: l_attrs,
                        inner_xml,
                    },
                );
                n_col_last = n_col;
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                let (n_col, l_attrs) = parse_cell_head(&e, n_row, n_col_last)?;
                sheet_row.cells.insert(
                    n_col,
                    SpecSheetCell {
                        attrs: l_attrs,
                        ..Default::default()
                    },
                );
                n_col_last = n_col;
            }
            Event::End(e) if e.local_name().as_ref() == b"row" => return Ok(()),
            Event::Eof => {
                return Err(EnumXlsxExportError::InvalidPackage(format!(
                    "{part_name}: unterminated <row r=\"{n_row}\">"
                )));
            }
            _ => {}
        }
    }
}

/// Display text of a stored cell, following its `t` attribute.
fn derive_cell_text(
    cell: &SpecSheetCell,
    shared_strings: &[String],
) -> Result<Option<String>, EnumXlsxExportError> {
    let mut reader = Reader::from_str(&cell.inner_xml);
    reader.config_mut().trim_text(false);

    let mut c_value: Option<String> = None;
    let mut c_inline: Option<String> = None;
    let mut if_in_v = false;
    let mut if_in_t = false;
    let mut n_depth_rph = 0usize;
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => match e.local_name().as_ref() {
                b"v" => {
                    if_in_v = true;
                    c_value.get_or_insert_with(String::new);
                }
                b"is" => {
                    c_inline.get_or_insert_with(String::new);
                }
                b"t" => if_in_t = true,
                b"rPh" => n_depth_rph += 1,
                _ => {}
            },
            Event::Text(e) => {
                let c_text = e.unescape()?;
                if if_in_v {
                    if let Some(c_value) = c_value.as_mut() {
                        c_value.push_str(&c_text);
                    }
                } else if if_in_t && n_depth_rph == 0 {
                    if let Some(c_inline) = c_inline.as_mut() {
                        c_inline.push_str(&c_text);
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => if_in_v = false,
                b"t" => if_in_t = false,
                b"rPh" => n_depth_rph = n_depth_rph.saturating_sub(1),
                _ => {}
            },
            _ => {}
        }
    }

    let c_text = match cell.attr("t").unwrap_or("n") {
        "s" => c_value
            .and_then(|c_idx| c_idx.trim().parse::<usize>().ok())
            .and_then(|n_idx| shared_strings.get(n_idx).cloned()),
        "inlineStr" => c_inline,
        "b" => c_value.map(|c_flag| {
            if c_flag.trim() == "1" {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }),
        "str" | "e" => c_value,
        _ => c_value.map(|c_number| derive_number_text(&c_number)),
    };
    Ok(c_text)
}

/// Integral numbers lose their fractional suffix (`"3.0" -> "3"`).
fn derive_number_text(raw: &str) -> String {
    let c_raw = raw.trim();
    match c_raw.parse::<f64>() {
        Ok(n_value) if n_value.is_finite() && n_value.fract() == 0.0 && n_value.abs() < 1e15 => {
            format!("{}", n_value as i64)
        }
        _ => c_raw.to_string(),
    }
}

/// `<is><t xml:space="preserve">..</t></is>` with XML-illegal control characters removed.
/// Attributes of the first `<f>` in a cell's inner XML.
fn derive_formula_attributes(inner_xml: &str) -> Option<Vec<(String, String)>> {
    let mut reader = Reader::from_str(inner_xml);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"f" => {
                return derive_attribute_list(&e).ok();
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// `(si, ref)` when the cell is the master of a shared formula.
fn derive_shared_formula_master(inner_xml: &str) -> Option<(String, SpecCellRange)> {
    let l_attrs = derive_formula_attributes(inner_xml)?;
    let derive_attr = |key: &str| {
        l_attrs
            .iter()
            .find(|(c_key, _)| c_key == key)
            .map(|(_, c_value)| c_value.as_str())
    };
    if derive_attr("t") != Some("shared") {
        return None;
    }
    Some((
        derive_attr("si")?.to_string(),
        parse_cell_range(derive_attr("ref")?)?,
    ))
}

/// Unescaped text of the cell's `<v>`.
fn derive_cached_value(inner_xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(inner_xml);
    reader.config_mut().trim_text(false);
    let mut c_value: Option<String> = None;
    let mut if_in_v = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.local_name().as_ref() == b"v" => {
                if_in_v = true;
                c_value.get_or_insert_with(String::new);
            }
            Event::Text(e) if if_in_v => c_value.as_mut()?.push_str(&e.unescape().ok()?),
            Event::End(e) if e.local_name().as_ref() == b"v" => if_in_v = false,
            Event::Eof => return c_value,
            _ => {}
        }
    }
}

fn derive_inline_string_xml(tag_is: &str, tag_t: &str, text: &str) -> String {
    let c_clean: String = text
        .chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\t' | '\n' | '\r'))
        .collect();
    format!(
        "<{tag_is}><{tag_t} xml:space=\"preserve\">{}</{tag_t}></{tag_is}>",
        escape(c_clean.as_str())
    )
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const C_SHEET_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><dimension ref="A1:C3"/><sheetViews><sheetView tabSelected="1" workbookViewId="0"><selection activeCell="B2" sqref="B2"/></sheetView></sheetViews><sheetFormatPr defaultRowHeight="15"/><sheetData><row r="1" spans="1:3"><c r="A1" s="1" t="s"><v>0</v></c></row><row r="2" spans="1:3"><c r="A2" t="s"><v>1</v></c><c r="B2" t="inlineStr"><is><t>Jm&amp;éno</t></is></c><c r="C2"><v>3.0</v></c></row><row r="3"><c r="A3" s="4"><f>B3*2</f><v>8</v></c><c r="B3" t="b"><v>1</v></c></row></sheetData><mergeCells count="2"><mergeCell ref="A1:B1"/><mergeCell ref="A3:A5"/></mergeCells><pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/></worksheet>"#;

    fn derive_test_sheet() -> XlsxSheet {
        XlsxSheet::parse(
            "Kontakty",
            "xl/worksheets/sheet1.xml",
            C_SHEET_XML.as_bytes(),
            vec!["Osoba".to_string(), "Příjmení".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_cell_text_follows_cell_type() {
        let sheet = derive_test_sheet();
        assert_eq!(sheet.cell_text(1, 1).as_deref(), Some("Osoba"));
        assert_eq!(sheet.cell_text(2, 1).as_deref(), Some("Příjmení"));
        assert_eq!(sheet.cell_text(2, 2).as_deref(), Some("Jm&éno"));
        assert_eq!(sheet.cell_text(2, 3).as_deref(), Some("3"));
        assert_eq!(sheet.cell_text(3, 1).as_deref(), Some("8"));
        assert_eq!(sheet.cell_text(3, 2).as_deref(), Some("TRUE"));
        assert_eq!(sheet.cell_text(9, 9), None);
        assert_eq!(sheet.merged_ranges().len(), 2);
        assert_eq!(sheet.name(), "Kontakty");
        assert_eq!(sheet.part_name(), "xl/worksheets/sheet1.xml");
    }

    #[test]
    fn test_set_cell_value_keeps_style_and_flags_formula() {
        let mut sheet = derive_test_sheet();
        sheet.set_cell_value(3, 1, &EnumCellValue::from("Novák <a&b>"), None);
        assert!(sheet.if_formula_overwritten());
        assert_eq!(sheet.cell_style(3, 1), 4);
        assert_eq!(sheet.cell_text(3, 1).as_deref(), Some("Novák <a&b>"));

        sheet.set_cell_value(4, 2, &EnumCellValue::Number(12.5), None);
        sheet.set_cell_value(4, 3, &EnumCellValue::None, Some(7));
        assert_eq!(sheet.cell_text(4, 2).as_deref(), Some("12.5"));
        assert_eq!(sheet.cell_text(4, 3), None);
        assert_eq!(sheet.cell_style(4, 3), 7);

        let c_xml = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_xml.contains(
            r#"<c r="A3" s="4" t="inlineStr"><is><t xml:space="preserve">Novák &lt;a&amp;b&gt;</t></is></c>"#
        ));
        assert!(c_xml.contains(r#"<c r="C4" s="7"/>"#));
        assert!(c_xml.contains(r#"<dimension ref="A1:C4"/>"#));
        assert!(!c_xml.contains("<f>"));
        assert!(c_xml.contains(r#"<row r="4"><c r="B4"><v>12.5</v></c><c r="C4" s="7"/></row>"#));
        assert!(c_xml.contains(r#"<row r="2" spans="1:3">"#));
    }

    #[test]
    fn test_overwriting_shared_formula_master_detaches_dependents() {
        let c_xml = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="3"><c r="A3"><v>1</v></c><c r="C3" t="str"><f t="shared" ref="C3:C5" si="0">A3&amp;B3</f><v>1x</v></c></row><row r="4"><c r="C4" t="str"><f t="shared" si="0"/><v>2&amp;y</v></c></row><row r="5"><c r="C5" s="2"><f t="shared" si="0"/><v>7</v></c><c r="D5"><f t="shared" ref="D5:D6" si="1">A5</f><v>3</v></c></row><row r="6"><c r="D6"><f t="shared" si="1"/><v>3</v></c></row></sheetData></worksheet>"#;
        let mut sheet = XlsxSheet::parse("S", "xl/worksheets/sheet1.xml", c_xml.as_bytes(), vec![])
            .unwrap();

        sheet.set_cell_value(3, 3, &EnumCellValue::from("nový"), None);
        assert!(sheet.if_formula_overwritten());
        assert_eq!(sheet.cell_text(4, 3).as_deref(), Some("2&y"));
        assert_eq!(sheet.cell_text(5, 3).as_deref(), Some("7"));

        let c_out = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_out.contains(
            r#"<c r="C3" t="inlineStr"><is><t xml:space="preserve">nový</t></is></c>"#
        ));
        assert!(c_out.contains(
            r#"<c r="C4" t="inlineStr"><is><t xml:space="preserve">2&amp;y</t></is></c>"#
        ));
        assert!(c_out.contains(r#"<c r="C5" s="2"><v>7</v></c>"#));
        assert!(!c_out.contains(r#"si="0""#));
        assert!(c_out.contains(r#"<f t="shared" ref="D5:D6" si="1">A5</f>"#));
        assert!(c_out.contains(r#"<c r="D6"><f t="shared" si="1"/><v>3</v></c>"#));
    }

    #[test]
    fn test_datetime_value_is_written_as_serial() {
        let mut sheet = derive_test_sheet();
        let dt_value = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        sheet.set_cell_value(5, 1, &EnumCellValue::DateTime(dt_value), Some(9));
        let c_xml = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_xml.contains(r#"<c r="A5" s="9"><v>45293.5</v></c>"#));
    }

    #[test]
    fn test_merge_cells_rewrite_and_removal() {
        let mut sheet = derive_test_sheet();
        let l_kept = vec![sheet.merged_ranges()[0]];
        sheet.set_merged_ranges(l_kept);
        let c_xml = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_xml.contains(r#"<mergeCells count="1"><mergeCell ref="A1:B1"/></mergeCells>"#));

        sheet.set_merged_ranges(vec![]);
        let c_xml = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(!c_xml.contains("mergeCell"));
        assert!(c_xml.contains("<pageMargins "));
    }

    #[test]
    fn test_freeze_pane_replaces_existing_selection() {
        let mut sheet = derive_test_sheet();
        assert_eq!(sheet.freeze_panes(), None);
        sheet.set_freeze_panes(3, 1);
        assert_eq!(sheet.freeze_panes(), Some((3, 1)));
        let c_xml = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_xml.contains(
            r#"<sheetView tabSelected="1" workbookViewId="0"><pane ySplit="2" topLeftCell="A3" activePane="bottomLeft" state="frozen"/><selection pane="bottomLeft" activeCell="A3" sqref="A3"/></sheetView>"#
        ));
        assert!(!c_xml.contains(r#"activeCell="B2""#));
    }

    #[test]
    fn test_freeze_pane_inserts_sheet_views_when_missing() {
        let c_xml = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetFormatPr defaultRowHeight="15"/><sheetData/></worksheet>"#;
        let mut sheet = XlsxSheet::parse("S", "xl/worksheets/sheet1.xml", c_xml.as_bytes(), vec![])
            .unwrap();
        sheet.set_freeze_panes(3, 1);
        sheet.set_cell_value(3, 1, &EnumCellValue::from("x"), None);
        let c_out = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_out.contains(r#"<sheetViews><sheetView workbookViewId="0"><pane ySplit="2""#));
        assert!(c_out.find("<sheetViews>").unwrap() < c_out.find("<sheetFormatPr").unwrap());
        assert!(c_out.contains(r#"<sheetData><row r="3"><c r="A3" t="inlineStr">"#));
        assert!(c_out.ends_with("</sheetData></worksheet>"));
    }

    #[test]
    fn test_prefixed_worksheet_keeps_prefix() {
        let c_xml = r#"<x:worksheet xmlns:x="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><x:sheetData><x:row r="1"><x:c r="A1" t="inlineStr"><x:is><x:t>a</x:t></x:is></x:c></x:row></x:sheetData></x:worksheet>"#;
        let mut sheet = XlsxSheet::parse("S", "xl/worksheets/sheet1.xml", c_xml.as_bytes(), vec![])
            .unwrap();
        assert_eq!(sheet.cell_text(1, 1).as_deref(), Some("a"));
        sheet.set_cell_value(2, 1, &EnumCellValue::from("b"), None);
        let c_out = String::from_utf8(sheet.to_xml().unwrap()).unwrap();
        assert!(c_out.contains(
            r#"<x:row r="2"><x:c r="A2" t="inlineStr"><x:is><x:t xml:space="preserve">b</x:t></x:is></x:c></x:row>"#
        ));
    }
}
